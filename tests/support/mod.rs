//! Shared integration-test harness.
//!
//! Grounded in the teacher's own `transaction-core` test harness
//! (`tests/transaction_test_utils.rs`'s `MockTransport`), but written fresh
//! against this crate's actual `Transport` trait (`send_message` takes the
//! message by reference and `TransportEvent::MessageReceived` carries
//! `source`/`local` rather than the teacher's by-value/`destination` shape).
//! Responses are injected straight through `Provider::handle_inbound` rather
//! than simulating a two-way link — the production wiring
//! (`SipStack::spawn_inbound_pump`) isn't needed to exercise the
//! transaction/dialog/refresher/auth layers under test.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rvoip_sip_core::builder::SimpleRequestBuilder;
use rvoip_sip_core::types::contact::ContactParamInfo;
use rvoip_sip_core::types::{Param, TypedHeader};
use rvoip_sip_core::{
    Address, CallId, Contact, Expires, From as FromHeader, Message, Method, Request, To as ToHeader, Uri,
};
use tokio::sync::Mutex;

use sip_stack_core::error::Result;
use sip_stack_core::hop::Hop;
use sip_stack_core::transport::channel::ChannelState;
use sip_stack_core::transport::{Channel, Transport};

/// Captures every message handed to `send_message` instead of writing it to
/// a socket, so a test can assert on what a transaction/refresher/dialog
/// actually sent.
#[derive(Debug)]
pub struct MockTransport {
    sent: Mutex<VecDeque<(Message, SocketAddr)>>,
    local: SocketAddr,
    reliable: bool,
}

impl MockTransport {
    pub fn new(reliable: bool) -> Self {
        MockTransport {
            sent: Mutex::new(VecDeque::new()),
            local: "127.0.0.1:5060".parse().unwrap(),
            reliable,
        }
    }

    pub async fn pop_sent(&self) -> Option<(Message, SocketAddr)> {
        self.sent.lock().await.pop_front()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }

    async fn send_message(&self, message: &Message, destination: SocketAddr) -> Result<()> {
        self.sent.lock().await.push_back((message.clone(), destination));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn is_reliable(&self) -> bool {
        self.reliable
    }
}

/// Builds a `Channel` already in the READY state with a `MockTransport`
/// wired in and a resolved destination set, following the same
/// ResDone→Connecting→Ready path `stack.rs::connect_udp` drives in
/// production.
pub async fn ready_channel(peer: Hop, reliable: bool) -> (Arc<Channel>, Arc<MockTransport>) {
    let channel = Channel::new(peer, reliable);
    let mock = Arc::new(MockTransport::new(reliable));
    channel.set_transport(mock.clone()).await;
    channel.set_local_addr("127.0.0.1:5060".parse().unwrap()).await;
    channel.set_resolved_addr("203.0.113.10:5060".parse().unwrap()).await;
    channel.transition(ChannelState::ResDone);
    channel.transition(ChannelState::Connecting);
    channel.transition(ChannelState::Ready);
    (channel, mock)
}

/// Polls a `MockTransport`'s queue, yielding to let already-spawned tasks
/// run, until a message shows up. Used instead of a blind `sleep` since the
/// sends under test happen synchronously inside a spawned task and only
/// need scheduler turns, not wall-clock time, to land.
pub async fn next_sent(mock: &MockTransport) -> (Message, SocketAddr) {
    for _ in 0..500 {
        if let Some(item) = mock.pop_sent().await {
            return item;
        }
        tokio::task::yield_now().await;
    }
    panic!("no message was sent within the scheduling budget");
}

pub async fn no_more_sent(mock: &MockTransport) {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(mock.sent_count().await, 0, "expected no further sends");
}

/// Advances the paused virtual clock and drains whatever that wakes.
pub async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn uri(s: &str) -> Uri {
    Uri::from_str(s).unwrap()
}

fn plain_address(u: &str) -> Address {
    Address { display_name: None, uri: uri(u), params: vec![] }
}

/// Builds a REGISTER with From/To/Call-ID/Contact/Expires but deliberately
/// no CSeq header, matching how a caller hands an unsent template to
/// `Refresher::spawn` (its own `build_refresh_request` fills CSeq=1 on the
/// very first send).
pub fn register_request(aor: &str, contact_uri: &str, from_tag: &str, call_id: &str, expires: u32) -> Request {
    let mut from = FromHeader::new(plain_address(aor));
    from.set_tag(from_tag);
    let to = ToHeader::new(plain_address(aor));

    let contact = Contact::new_params(vec![ContactParamInfo {
        address: Address {
            display_name: None,
            uri: uri(contact_uri),
            params: vec![Param::Expires(expires)],
        },
    }]);

    SimpleRequestBuilder::new(Method::Register, aor)
        .unwrap()
        .header(TypedHeader::From(from))
        .header(TypedHeader::To(to))
        .header(TypedHeader::CallId(CallId::new(call_id)))
        .header(TypedHeader::Contact(contact))
        .header(TypedHeader::Expires(Expires(expires)))
        .build()
}

/// Builds an INVITE with From/To/Call-ID/Contact and an explicit CSeq (an
/// application always stamps CSeq=1 on the first request of a new
/// transaction, unlike the refresher's lazily-filled template).
pub fn invite_request(target: &str, contact_uri: &str, from_tag: &str, call_id: &str) -> Request {
    let mut from = FromHeader::new(plain_address(&format!("sip:caller@{}", "example.org")));
    from.set_tag(from_tag);
    let to = ToHeader::new(plain_address(target));

    let contact = Contact::new_params(vec![ContactParamInfo {
        address: Address { display_name: None, uri: uri(contact_uri), params: vec![] },
    }]);

    SimpleRequestBuilder::new(Method::Invite, target)
        .unwrap()
        .header(TypedHeader::From(from))
        .header(TypedHeader::To(to))
        .header(TypedHeader::CallId(CallId::new(call_id)))
        .header(TypedHeader::Contact(contact))
        .header(TypedHeader::CSeq(rvoip_sip_core::CSeq::new(1, Method::Invite)))
        .build()
}

/// Builds a bare OPTIONS request (no Contact needed; used only to drive the
/// NICT retransmit/timeout schedule).
pub fn options_request(target: &str, from_tag: &str, call_id: &str) -> Request {
    let mut from = FromHeader::new(plain_address(&format!("sip:prober@{}", "example.org")));
    from.set_tag(from_tag);
    let to = ToHeader::new(plain_address(target));

    SimpleRequestBuilder::new(Method::Options, target)
        .unwrap()
        .header(TypedHeader::From(from))
        .header(TypedHeader::To(to))
        .header(TypedHeader::CallId(CallId::new(call_id)))
        .header(TypedHeader::CSeq(rvoip_sip_core::CSeq::new(1, Method::Options)))
        .build()
}
