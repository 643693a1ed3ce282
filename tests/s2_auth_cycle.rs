//! S2 (spec.md §8): a 401 challenge gets cached, the next request on the
//! same Call-ID is auto-filled with a matching digest Authorization, and the
//! cycle ends in a 200 OK with no further challenge.

mod support;

use std::sync::Arc;

use md5::{Digest as _, Md5};
use rvoip_sip_core::types::TypedHeader;
use rvoip_sip_core::{
    Algorithm, CSeq, Challenge, Credentials, DigestParam, Message, Method, Qop, StatusCode, WwwAuthenticate,
};

use sip_stack_core::config::StackConfig;
use sip_stack_core::hop::{Hop, TransportKind};
use sip_stack_core::provider::auth_context::AuthCredentials;
use sip_stack_core::provider::Provider;
use sip_stack_core::transaction::responses::{build_response, to_tag_for_request};

use support::{next_sent, ready_channel, register_request};

fn hex_md5(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    let mut out = String::with_capacity(32);
    use std::fmt::Write;
    for b in digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn digest_param(params: &[DigestParam], wanted: impl Fn(&DigestParam) -> bool) -> Option<DigestParam> {
    params.iter().find(|p| wanted(p)).cloned()
}

#[tokio::test]
async fn challenge_is_cached_and_autofilled_then_succeeds() {
    let config = StackConfig::default();
    let (provider, _events) = Provider::new(config.clone());
    let peer = Hop::new(TransportKind::Udp, "registrar.example.org", Some(5060));
    let (channel, mock) = ready_channel(peer, false).await;

    provider
        .set_auth_requested_callback(Arc::new(|_realm: &str| {
            Some(AuthCredentials {
                username: "alice".to_string(),
                password: "hunter2".to_string(),
                ha1: None,
            })
        }))
        .await;

    let template = register_request(
        "sip:alice@example.org",
        "sip:alice@203.0.113.5:5060",
        "fromtag2",
        "call-s2@example.org",
        3600,
    );
    let first_request_template = template.clone().with_header(TypedHeader::CSeq(CSeq::new(1, Method::Register)));

    let first_txn = provider
        .send_tracked_request(first_request_template, channel.clone(), "192.0.2.1", None)
        .await
        .expect("send should succeed");

    let (first_sent, _addr) = next_sent(&mock).await;
    let first_request = match first_sent {
        Message::Request(r) => r,
        _ => panic!("expected a request"),
    };
    assert!(
        first_request.typed_header::<rvoip_sip_core::Authorization>().is_none(),
        "first attempt has no cached challenge yet"
    );

    let to_tag = to_tag_for_request(&first_request);
    let challenge = WwwAuthenticate(vec![Challenge::Digest {
        params: vec![
            DigestParam::Realm("example.org".to_string()),
            DigestParam::Nonce("n0nce123".to_string()),
            DigestParam::Qop(vec![Qop::Auth]),
            DigestParam::Algorithm(Algorithm::Md5),
        ],
    }]);
    let unauthorized = build_response(&first_request, StatusCode::Unauthorized, &to_tag)
        .with_header(TypedHeader::WwwAuthenticate(challenge));

    provider
        .handle_inbound(Message::Response(unauthorized), "203.0.113.10:5060".parse().unwrap())
        .await;

    let first_final = first_txn.wait_final().await.expect("401 is a final response");
    assert_eq!(first_final.status_code(), 401);

    let second_request_template = template.with_header(TypedHeader::CSeq(CSeq::new(2, Method::Register)));
    let second_txn = provider
        .send_tracked_request(second_request_template, channel.clone(), "192.0.2.1", None)
        .await
        .expect("resend should succeed");

    let (second_sent, _addr) = next_sent(&mock).await;
    let second_request = match second_sent {
        Message::Request(r) => r,
        _ => panic!("expected a request"),
    };

    let auth = second_request
        .typed_header::<rvoip_sip_core::Authorization>()
        .expect("second attempt must carry an auto-filled Authorization header");
    let params = match &auth.0 {
        Credentials::Digest { params } => params,
        other => panic!("expected digest credentials, got {other:?}"),
    };

    let cnonce = match digest_param(params, |p| matches!(p, DigestParam::Cnonce(_))) {
        Some(DigestParam::Cnonce(c)) => c,
        _ => panic!("expected a cnonce for qop=auth"),
    };
    let nc = match digest_param(params, |p| matches!(p, DigestParam::NonceCount(_))) {
        Some(DigestParam::NonceCount(n)) => n,
        _ => panic!("expected a nonce count for qop=auth"),
    };
    let actual_response = match digest_param(params, |p| matches!(p, DigestParam::Response(_))) {
        Some(DigestParam::Response(r)) => r,
        _ => panic!("expected a response value"),
    };
    let request_uri = match digest_param(params, |p| matches!(p, DigestParam::Uri(_))) {
        Some(DigestParam::Uri(u)) => u.to_string(),
        _ => panic!("expected a digest uri"),
    };

    let ha1 = hex_md5("alice:example.org:hunter2");
    let ha2 = hex_md5(&format!("REGISTER:{request_uri}"));
    let expected = hex_md5(&format!("{}:{}:{:08x}:{}:auth:{}", ha1, "n0nce123", nc, cnonce, ha2));
    assert_eq!(actual_response, expected);

    let to_tag2 = to_tag_for_request(&second_request);
    let ok = build_response(&second_request, StatusCode::Ok, &to_tag2);
    provider
        .handle_inbound(Message::Response(ok), "203.0.113.10:5060".parse().unwrap())
        .await;

    let second_final = second_txn.wait_final().await.expect("200 OK is final");
    assert_eq!(second_final.status_code(), 200);
}
