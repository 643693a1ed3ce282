//! Local response construction, standing in for the teacher's
//! (curated-pack-absent) `response_builders`/`SimpleResponseBuilder`: builds
//! a final/provisional [`Response`] from the request that triggered it,
//! copying Via/From/Call-ID/CSeq and attaching a local To-tag.

use rvoip_sip_core::types::TypedHeader;
use rvoip_sip_core::{CallId, CSeq, From, Request, Response, StatusCode, Via};

use crate::transport::branch::{compute_to_tag, BranchInputs};

/// Derives the To-tag a server transaction attaches to its responses from
/// the triggering request's invariants, so retransmitted requests always
/// get back the same tag (same recomputation property as the Via branch).
pub fn to_tag_for_request(request: &Request) -> String {
    let from_tag = request
        .typed_header::<From>()
        .and_then(|f| f.tag())
        .unwrap_or("")
        .to_string();
    let call_id = request
        .typed_header::<CallId>()
        .map(|c| c.to_string())
        .unwrap_or_default();
    let cseq_number = request.typed_header::<CSeq>().map(|c| c.seq).unwrap_or(0);
    let previous_via = request
        .typed_header::<Via>()
        .map(|v| v.to_string())
        .unwrap_or_default();

    compute_to_tag(&BranchInputs {
        request_uri: &request.uri().to_string(),
        from_tag: &from_tag,
        to_tag: "",
        call_id: &call_id,
        cseq_number,
        previous_via: &previous_via,
    })
}

/// Builds a response to `request` carrying `status`, copying Via (all
/// entries, so a multi-hop Via stack still routes the response back
/// correctly), From, Call-ID and CSeq from the request, and attaching a
/// To-tag (server transactions always tag the dialog side of To, §4.5).
pub fn build_response(request: &Request, status: StatusCode, to_tag: &str) -> Response {
    let mut response = Response::new(status);

    for header in &request.headers {
        match header {
            TypedHeader::Via(_) | TypedHeader::CallId(_) | TypedHeader::From(_) | TypedHeader::CSeq(_) => {
                response = response.with_header(header.clone());
            }
            TypedHeader::To(to) => {
                let mut tagged = to.clone();
                if tagged.tag().is_none() {
                    tagged.set_tag(to_tag);
                }
                response = response.with_header(TypedHeader::To(tagged));
            }
            _ => {}
        }
    }

    response
}
