//! S6 (spec.md §8): a dialog with an un-ACKed 2xx retransmits it on the
//! same T2-capped schedule as the NICT (both built on
//! `timer::response_retransmit_interval`, an alias of the same function),
//! then gives up at Timer H (64*T1) by sending a BYE and terminating.

mod support;

use std::sync::Arc;
use std::time::Duration;

use rvoip_sip_core::{CSeq, Message, Method, Response, StatusCode};
use tokio::sync::Mutex;

use sip_stack_core::config::StackConfig;
use sip_stack_core::dialog::{refresh_200ok, Dialog, DialogType};

use support::{advance, next_sent, ready_channel};
use sip_stack_core::hop::{Hop, TransportKind};

fn sample_200ok() -> Response {
    let mut response = Response::new(StatusCode::Ok);
    response = response.with_header(rvoip_sip_core::types::TypedHeader::CSeq(CSeq::new(1, Method::Invite)));
    response
}

#[tokio::test(start_paused = true)]
async fn unacked_200ok_retransmits_then_gives_up_with_a_bye() {
    let config = StackConfig::default();
    let peer = Hop::new(TransportKind::Udp, "bob.example.org", Some(5060));
    let (channel, mock) = ready_channel(peer, false).await;

    let mut dialog = Dialog::new(
        DialogType::Invite,
        "call-s6@example.org".into(),
        "sip:alice@example.org".parse().unwrap(),
        "sip:bob@example.org".parse().unwrap(),
        Some("fromtag6".into()),
        Some("totag6".into()),
        true,
    );
    dialog.needs_ack = true;
    dialog.local_cseq = 1;
    dialog.remote_target = "sip:bob@203.0.113.30:5060".parse().unwrap();
    dialog.last_200ok = Some(sample_200ok());
    let dialog_id = dialog.id;
    let dialog = Arc::new(Mutex::new(dialog));

    let _handle = refresh_200ok::spawn(dialog_id, dialog.clone(), channel, config.clone());

    let retransmit_times_ms = [500u64, 1500, 3500, 7500, 11500, 15500, 19500, 23500, 27500, 31500];
    let mut elapsed_ms = 0u64;
    for &target_ms in &retransmit_times_ms {
        advance(Duration::from_millis(target_ms - elapsed_ms)).await;
        elapsed_ms = target_ms;
        let (sent, _addr) = next_sent(&mock).await;
        match sent {
            Message::Response(r) => assert_eq!(r.status_code(), 200),
            _ => panic!("expected a retransmitted 200 OK at {target_ms}ms"),
        }
    }

    assert!(dialog.lock().await.needs_ack, "still waiting on the ACK before the deadline");

    // The deadline check only happens at the top of the loop, one tick after
    // the sleep clamped to it fires, so the Timer H instant itself still
    // produces one more 200 OK retransmit before give_up() runs.
    advance(Duration::from_millis(32_000 - elapsed_ms)).await;

    let (last_retransmit, _addr) = next_sent(&mock).await;
    match last_retransmit {
        Message::Response(r) => assert_eq!(r.status_code(), 200),
        _ => panic!("expected one final 200 OK retransmit exactly at the Timer H deadline"),
    }

    let (given_up, _addr) = next_sent(&mock).await;
    match given_up {
        Message::Request(r) => {
            assert_eq!(r.method, Method::Bye);
            let cseq = r.typed_header::<CSeq>().expect("BYE must carry a CSeq");
            assert_eq!(cseq.seq, 2, "BYE takes the next CSeq after the INVITE's");
        }
        _ => panic!("expected a BYE once the dialog gives up"),
    }

    let guard = dialog.lock().await;
    assert!(!guard.needs_ack);
    assert!(guard.is_terminated(), "dialog must terminate after giving up");
}
