//! The [`Dialog`] struct: state, route set, CSeq bookkeeping (§4.5, §3
//! "Dialog").
//!
//! Grounded in the teacher's `dialog::dialog_impl::Dialog`: a plain,
//! `Clone`/`Serialize` data struct built from a 2xx or early response to an
//! INVITE, with the same `from_2xx_response`/`from_provisional_response`
//! extraction shape. Extended with `dialog_type` (SUBSCRIBE-NOTIFY dialogs
//! share this struct), `is_secure`, `needs_ack`, `is_internal`, and the
//! `last_out_*`/`last_200ok` fields the 200 OK retransmit task needs.

use std::net::SocketAddr;
use std::time::SystemTime;

use rvoip_sip_core::types::TypedHeader;
use rvoip_sip_core::{Method, Request, Response, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::dialog_id::DialogId;
use super::dialog_state::DialogState;
use crate::error::{DialogError, Result};

/// What originally created this dialog (§4.5 "Dialog | type ∈ {INVITE,
/// SUBSCRIBE-NOTIFY}"). Both kinds share the same matching, CSeq, and
/// route-set machinery; only INVITE dialogs run 200 OK retransmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogType {
    Invite,
    SubscribeNotify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialog {
    pub id: DialogId,
    pub dialog_type: DialogType,
    pub state: DialogState,

    pub call_id: String,
    pub local_uri: Uri,
    pub remote_uri: Uri,
    pub local_tag: Option<String>,
    pub remote_tag: Option<String>,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    pub remote_target: Uri,
    pub route_set: Vec<Uri>,

    /// True when the local UA is the one that received the dialog-creating
    /// request (UAS side); false for the UAC side that sent it.
    pub is_server: bool,
    pub is_secure: bool,

    /// True between sending/receiving a 2xx for an INVITE and the matching
    /// ACK being observed (drives whether a retransmitted 2xx is still due).
    pub needs_ack: bool,
    /// True when this dialog exists only to support an internal operation
    /// (e.g. a refresher's own re-REGISTER) rather than an application
    /// request — the provider does not surface request-events for it.
    pub is_internal: bool,

    #[serde(skip)]
    pub last_out_invite: Option<Request>,
    #[serde(skip)]
    pub last_out_ack: Option<Request>,
    #[serde(skip)]
    pub last_200ok: Option<Response>,

    pub last_known_remote_addr: Option<SocketAddr>,
    pub last_successful_transaction_time: Option<SystemTime>,
}

impl Dialog {
    pub fn new(
        dialog_type: DialogType,
        call_id: String,
        local_uri: Uri,
        remote_uri: Uri,
        local_tag: Option<String>,
        remote_tag: Option<String>,
        is_server: bool,
    ) -> Self {
        Dialog {
            id: DialogId::new(),
            dialog_type,
            state: DialogState::Null,
            call_id,
            local_uri,
            remote_uri: remote_uri.clone(),
            local_tag,
            remote_tag,
            local_cseq: 0,
            remote_cseq: 0,
            remote_target: remote_uri,
            route_set: Vec::new(),
            is_server,
            is_secure: false,
            needs_ack: false,
            is_internal: false,
            last_out_invite: None,
            last_out_ack: None,
            last_200ok: None,
            last_known_remote_addr: None,
            last_successful_transaction_time: None,
        }
    }

    /// Builds a CONFIRMED dialog from a 2xx response to an INVITE (§4.5
    /// "on first 2xx enters CONFIRMED").
    pub fn from_2xx_response(request: &Request, response: &Response, is_server: bool) -> Option<Self> {
        if !(200..300).contains(&response.status_code()) {
            return None;
        }
        if request.method != Method::Invite {
            return None;
        }
        Self::from_response(DialogType::Invite, DialogState::Confirmed, request, response, is_server)
    }

    /// Builds an EARLY dialog from a tagged 1xx to an INVITE (§4.5 "on
    /// first 1xx with tag the dialog enters EARLY").
    pub fn from_provisional_response(request: &Request, response: &Response, is_server: bool) -> Option<Self> {
        let status = response.status_code();
        if !(101..200).contains(&status) {
            return None;
        }
        if request.method != Method::Invite {
            return None;
        }
        let to_tag = response.typed_header::<rvoip_sip_core::To>().and_then(|to| to.tag().map(str::to_string));
        if to_tag.is_none() {
            return None;
        }
        Self::from_response(DialogType::Invite, DialogState::Early, request, response, is_server)
    }

    fn from_response(
        dialog_type: DialogType,
        state: DialogState,
        request: &Request,
        response: &Response,
        is_server: bool,
    ) -> Option<Self> {
        let call_id = response.typed_header::<rvoip_sip_core::CallId>()?.to_string();
        let cseq_number = request.typed_header::<rvoip_sip_core::CSeq>()?.seq;

        let to_header = response.typed_header::<rvoip_sip_core::To>()?;
        let from_header = response.typed_header::<rvoip_sip_core::From>()?;
        let to_tag = to_header.tag().map(str::to_string);
        let from_tag = from_header.tag().map(str::to_string);

        // `is_server` names the local UA's role, not the From/To grammatical
        // roles: a UAS's local side is always the To header.
        let (local_tag, remote_tag, local_uri, remote_uri) = if is_server {
            (to_tag, from_tag, to_header.uri.clone(), from_header.uri.clone())
        } else {
            (from_tag, to_tag, from_header.uri.clone(), to_header.uri.clone())
        };

        let remote_target = extract_contact_uri(response)?;
        let route_set = extract_route_set(response, !is_server);

        Some(Dialog {
            id: DialogId::new(),
            dialog_type,
            state,
            call_id,
            local_uri,
            remote_uri,
            local_tag,
            remote_tag,
            local_cseq: if is_server { 0 } else { cseq_number },
            remote_cseq: if is_server { cseq_number } else { 0 },
            remote_target,
            route_set,
            is_server,
            is_secure: false,
            needs_ack: matches!(state, DialogState::Confirmed),
            is_internal: false,
            last_out_invite: None,
            last_out_ack: None,
            last_200ok: None,
            last_known_remote_addr: None,
            last_successful_transaction_time: None,
        })
    }

    /// (§4.5 "UAS checks inbound cseq ≥ expected else rejects"). Rejection
    /// is "ignore the request", not an error response, hence `Result` here
    /// surfaces to a caller that decides how to react.
    pub fn validate_and_update_remote_cseq(&mut self, request: &Request) -> Result<()> {
        let cseq = request
            .typed_header::<rvoip_sip_core::CSeq>()
            .ok_or_else(|| DialogError::MissingHeader("CSeq".into()))?;
        if self.remote_cseq != 0 && cseq.seq < self.remote_cseq {
            return Err(DialogError::OutOfOrderCSeq {
                got: cseq.seq,
                expected: self.remote_cseq,
            }
            .into());
        }
        self.remote_cseq = cseq.seq;
        Ok(())
    }

    /// (§4.5 "UAC local_cseq increments by 1 per non-ACK request. An ACK
    /// reuses the INVITE's cseq number.")
    pub fn next_local_cseq(&mut self, method: &Method) -> u32 {
        if *method != Method::Ack {
            self.local_cseq += 1;
        }
        self.local_cseq
    }

    /// (§4.5 "Target refresh: on CONFIRMED, a subsequent INVITE that
    /// succeeds refreshes the remote-target to the new Contact.")
    pub fn refresh_target_from_2xx(&mut self, response: &Response) {
        if let Some(uri) = extract_contact_uri(response) {
            self.remote_target = uri;
        }
    }

    pub fn confirm(&mut self, response: &Response) {
        if self.state == DialogState::Early {
            self.state = DialogState::Confirmed;
            if let Some(to) = response.typed_header::<rvoip_sip_core::To>() {
                if let Some(tag) = to.tag() {
                    self.remote_tag = Some(tag.to_string());
                }
            }
            self.refresh_target_from_2xx(response);
        }
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
        self.needs_ack = false;
    }

    pub fn is_terminated(&self) -> bool {
        self.state == DialogState::Terminated
    }

    pub fn update_remote_address(&mut self, addr: SocketAddr) {
        self.last_known_remote_addr = Some(addr);
        self.last_successful_transaction_time = Some(SystemTime::now());
    }

    /// The matching triple once CONFIRMED (§3 "Dialog", invariant).
    pub fn match_triple(&self) -> Option<(String, String, String)> {
        match (&self.local_tag, &self.remote_tag) {
            (Some(l), Some(r)) => Some((self.call_id.clone(), l.clone(), r.clone())),
            _ => None,
        }
    }
}

fn extract_contact_uri(response: &Response) -> Option<Uri> {
    use rvoip_sip_core::types::contact::ContactValue;

    response.headers.iter().find_map(|h| match h {
        TypedHeader::Contact(contacts) => contacts.0.iter().find_map(|value| match value {
            ContactValue::Params(infos) => infos.first().map(|info| info.address.uri.clone()),
            ContactValue::Star => None,
        }),
        _ => None,
    })
}

fn extract_route_set(response: &Response, reverse: bool) -> Vec<Uri> {
    let routes: Vec<Uri> = response
        .headers
        .iter()
        .filter_map(|h| match h {
            TypedHeader::RecordRoute(routes) => Some(routes.0.iter().map(|r| r.uri().clone()).collect::<Vec<_>>()),
            _ => None,
        })
        .flatten()
        .collect();

    if reverse {
        routes.into_iter().rev().collect()
    } else {
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn new_dialog_starts_null() {
        let dialog = Dialog::new(
            DialogType::Invite,
            "call-1".into(),
            uri("sip:alice@example.com"),
            uri("sip:bob@example.com"),
            Some("tag-a".into()),
            None,
            false,
        );
        assert_eq!(dialog.state, DialogState::Null);
        assert!(dialog.match_triple().is_none());
    }

    #[test]
    fn local_cseq_skips_ack() {
        let mut dialog = Dialog::new(
            DialogType::Invite,
            "call-1".into(),
            uri("sip:alice@example.com"),
            uri("sip:bob@example.com"),
            Some("tag-a".into()),
            Some("tag-b".into()),
            false,
        );
        assert_eq!(dialog.next_local_cseq(&Method::Invite), 1);
        assert_eq!(dialog.next_local_cseq(&Method::Ack), 1);
        assert_eq!(dialog.next_local_cseq(&Method::Bye), 2);
    }

    #[test]
    fn out_of_order_cseq_rejected() {
        let mut dialog = Dialog::new(
            DialogType::Invite,
            "call-1".into(),
            uri("sip:alice@example.com"),
            uri("sip:bob@example.com"),
            Some("tag-a".into()),
            Some("tag-b".into()),
            true,
        );
        dialog.remote_cseq = 5;
        let request = rvoip_sip_core::builder::SimpleRequestBuilder::new(Method::Bye, "sip:alice@example.com")
            .unwrap()
            .header(TypedHeader::CSeq(rvoip_sip_core::CSeq::new(3, Method::Bye)))
            .build();
        assert!(dialog.validate_and_update_remote_cseq(&request).is_err());
    }

    #[test]
    fn terminate_clears_needs_ack() {
        let mut dialog = Dialog::new(
            DialogType::Invite,
            "call-1".into(),
            uri("sip:alice@example.com"),
            uri("sip:bob@example.com"),
            Some("tag-a".into()),
            Some("tag-b".into()),
            false,
        );
        dialog.needs_ack = true;
        dialog.terminate();
        assert!(!dialog.needs_ack);
        assert!(dialog.is_terminated());
    }
}
