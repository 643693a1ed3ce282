//! Pure matching-key extraction for the dispatch algorithm (§4.6): no
//! registry lookups live here, only "what key would this message match
//! under" so [`super::Provider`] can stay focused on orchestration.

use rvoip_sip_core::types::TypedHeader;
use rvoip_sip_core::{CallId, CSeq, From, Request, Response, To};

use crate::transport::branch::{compute_rfc2543_key, is_rfc3261_branch, Rfc2543Inputs};

/// The two outcomes of extracting a matching key from an inbound message's
/// top Via (§4.6 rules 1-2): a real RFC 3261 branch, usable directly as part
/// of a [`crate::transaction::TransactionKey`], or a heuristic RFC 2543
/// fallback key hashed from message invariants.
#[derive(Debug, Clone)]
pub enum MatchKey {
    Branch(String),
    Rfc2543(String),
}

fn top_via_branch(headers: &[TypedHeader]) -> Option<String> {
    headers.iter().find_map(|h| match h {
        TypedHeader::Via(via) => via.branch().map(str::to_string),
        _ => None,
    })
}

/// §4.6 rule 1/2: derive the matching key for an inbound request.
pub fn request_match_key(request: &Request) -> MatchKey {
    match top_via_branch(&request.headers) {
        Some(branch) if is_rfc3261_branch(&branch) => MatchKey::Branch(branch),
        branch => {
            let from_full = request
                .typed_header::<From>()
                .map(|f| f.to_string())
                .unwrap_or_default();
            let to_uri = request
                .typed_header::<To>()
                .map(|t| t.uri.to_string())
                .unwrap_or_default();
            let call_id = request
                .typed_header::<CallId>()
                .map(|c| c.to_string())
                .unwrap_or_default();
            let cseq_number = request.typed_header::<CSeq>().map(|c| c.seq).unwrap_or(0);
            let via_branch = branch.unwrap_or_default();

            MatchKey::Rfc2543(compute_rfc2543_key(&Rfc2543Inputs {
                from_full: &from_full,
                to_uri: &to_uri,
                call_id: &call_id,
                cseq_number,
                via_branch: &via_branch,
            }))
        }
    }
}

/// §4.6 rule 5: responses are matched to client transactions by (branch,
/// method) taken from the response's own top Via (the one the request that
/// created the transaction carried).
pub fn response_branch(response: &Response) -> Option<String> {
    top_via_branch(&response.headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvoip_sip_core::builder::RequestBuilder;
    use rvoip_sip_core::types::{Address, CallId as CallIdHeader, CSeq as CSeqHeader, From as FromHeader, Method, Param, Uri, Via as ViaHeader};

    fn request_with_via(branch: Option<&str>) -> Request {
        let from_addr = Address::new("sip:alice@example.com".parse::<Uri>().unwrap());
        let to_addr = Address::new("sip:bob@example.org".parse::<Uri>().unwrap());
        let mut builder = RequestBuilder::new(Method::Invite, "sip:bob@example.org")
            .unwrap()
            .header(TypedHeader::From(FromHeader::new(from_addr)))
            .header(TypedHeader::To(rvoip_sip_core::To::new(to_addr)))
            .header(TypedHeader::CallId(CallIdHeader::new("call-1@host")))
            .header(TypedHeader::CSeq(CSeqHeader::new(1, Method::Invite)));

        if let Some(branch) = branch {
            let via = ViaHeader::new("SIP", "2.0", "UDP", "pc.example.com", Some(5060), vec![Param::branch(branch)]).unwrap();
            builder = builder.header(TypedHeader::Via(via));
        }
        builder.build()
    }

    #[test]
    fn rfc3261_branch_is_used_directly() {
        let request = request_with_via(Some("z9hG4bK.abc123"));
        match request_match_key(&request) {
            MatchKey::Branch(b) => assert_eq!(b, "z9hG4bK.abc123"),
            MatchKey::Rfc2543(_) => panic!("expected a real branch"),
        }
    }

    #[test]
    fn missing_cookie_falls_back_to_rfc2543_key() {
        let request = request_with_via(Some("legacy-branch"));
        match request_match_key(&request) {
            MatchKey::Rfc2543(_) => {}
            MatchKey::Branch(_) => panic!("expected an rfc2543 fallback"),
        }
    }

    #[test]
    fn no_via_at_all_falls_back_to_rfc2543_key() {
        let request = request_with_via(None);
        assert!(matches!(request_match_key(&request), MatchKey::Rfc2543(_)));
    }
}
