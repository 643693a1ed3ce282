//! S1 (spec.md §8): a REGISTER refresher bumps CSeq on every renewal and
//! schedules the next send at `refresh_window_max` of the obtained expiry.

mod support;

use std::sync::Arc;
use std::time::Duration;

use rvoip_sip_core::{CSeq, Message, StatusCode};
use tokio::sync::mpsc;

use sip_stack_core::config::StackConfig;
use sip_stack_core::hop::{Hop, TransportKind};
use sip_stack_core::provider::Provider;
use sip_stack_core::refresher::{Refresher, RefresherEvent};
use sip_stack_core::transaction::responses::{build_response, to_tag_for_request};

use support::{next_sent, ready_channel, register_request};

fn cseq_of(message: &Message) -> u32 {
    match message {
        Message::Request(r) => r.typed_header::<CSeq>().unwrap().seq,
        Message::Response(r) => r.typed_header::<CSeq>().unwrap().seq,
    }
}

#[tokio::test(start_paused = true)]
async fn register_refresh_advances_cseq_and_reschedules_at_90_percent() {
    let config = StackConfig::default();
    let (provider, _provider_events) = Provider::new(config.clone());
    let peer = Hop::new(TransportKind::Udp, "registrar.example.org", Some(5060));
    let (channel, mock) = ready_channel(peer, false).await;

    let request = register_request(
        "sip:alice@example.org",
        "sip:alice@203.0.113.5:5060",
        "fromtag1",
        "call-s1@example.org",
        3600,
    );

    let (events_tx, mut events_rx) = mpsc::channel::<RefresherEvent>(8);
    let _refresher: Arc<Refresher> = Refresher::spawn(
        request,
        channel,
        provider.clone(),
        config.clone(),
        "192.0.2.1",
        None,
        3600,
        events_tx,
    );

    let (first_sent, _addr) = next_sent(&mock).await;
    assert_eq!(cseq_of(&first_sent), 1, "first REGISTER must start CSeq at 1");

    let sent_request = match first_sent {
        Message::Request(r) => r,
        _ => panic!("expected a request"),
    };
    let to_tag = to_tag_for_request(&sent_request);
    let response = build_response(&sent_request, StatusCode::Ok, &to_tag);

    provider
        .handle_inbound(Message::Response(response), "203.0.113.10:5060".parse().unwrap())
        .await;

    let event = events_rx.recv().await.expect("refresher must report an outcome");
    match event {
        RefresherEvent::Refreshed { expires } => assert_eq!(expires, 3600),
        other => panic!("expected Refreshed, got {other:?}"),
    }

    // Let the refresher's run loop actually park on its next sleep before
    // advancing the clock past it.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    support::advance(Duration::from_secs_f64(3600.0 * 0.9)).await;

    let (second_sent, _addr) = next_sent(&mock).await;
    assert_eq!(cseq_of(&second_sent), 2, "second REGISTER must bump CSeq to 2");
}
