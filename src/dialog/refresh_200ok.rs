//! 200 OK retransmission for INVITE dialogs (§4.5.1).
//!
//! A UAS-side INVITE dialog keeps resending its 2xx until the matching ACK
//! arrives or a wall-clock budget of 64*T1 passes, at which point it gives
//! up and tears the dialog down with a BYE (the transaction layer already
//! retransmits the 2xx per-transaction, but a transaction terminates once
//! its own timer G/H window elapses; this task covers the dialog's longer
//! lived responsibility of reacting to an ACK that never shows up at all).

use std::sync::Arc;

use rvoip_sip_core::builder::SimpleRequestBuilder;
use rvoip_sip_core::types::TypedHeader;
use rvoip_sip_core::{Message, Method, Request};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::dialog_id::DialogId;
use super::dialog_impl::Dialog;
use crate::config::StackConfig;
use crate::transaction::timer;
use crate::transport::Channel;

/// Spawns the retransmit loop for one outstanding 2xx. Cancelled by
/// observing the ACK (caller drops the returned handle's sibling flag) or
/// naturally exits once the dialog's `needs_ack` is cleared.
pub fn spawn(
    dialog_id: DialogId,
    dialog: Arc<Mutex<Dialog>>,
    channel: Arc<Channel>,
    config: StackConfig,
) -> JoinHandle<()> {
    tokio::spawn(run(dialog_id, dialog, channel, config))
}

async fn run(dialog_id: DialogId, dialog: Arc<Mutex<Dialog>>, channel: Arc<Channel>, config: StackConfig) {
    if channel.is_reliable() {
        return;
    }

    let deadline = tokio::time::Instant::now() + timer::wait_for_ack(&config);
    let mut attempt = 0u32;
    let mut next_retransmit = tokio::time::Instant::now() + timer::response_retransmit_interval(&config, 0);

    loop {
        if tokio::time::Instant::now() >= deadline {
            give_up(dialog_id, &dialog, &channel).await;
            return;
        }

        tokio::time::sleep_until(next_retransmit.min(deadline)).await;

        let mut guard = dialog.lock().await;
        if !guard.needs_ack || guard.is_terminated() {
            return;
        }
        if let Some(response) = guard.last_200ok.clone() {
            drop(guard);
            let _ = channel.send(Message::Response(response)).await;
        }

        attempt += 1;
        next_retransmit = tokio::time::Instant::now() + timer::response_retransmit_interval(&config, attempt);
    }
}

async fn give_up(dialog_id: DialogId, dialog: &Mutex<Dialog>, channel: &Channel) {
    let mut guard = dialog.lock().await;
    if !guard.needs_ack || guard.is_terminated() {
        return;
    }
    guard.needs_ack = false;

    if let Some(bye) = build_bye(&guard) {
        drop(guard);
        let _ = channel.send(Message::Request(bye)).await;
        dialog.lock().await.terminate();
    } else {
        guard.terminate();
    }
    let _ = dialog_id;
}

fn build_bye(dialog: &Dialog) -> Option<Request> {
    let target = dialog.remote_target.to_string();
    let mut builder = SimpleRequestBuilder::new(Method::Bye, &target).ok()?;

    if let Some(invite) = &dialog.last_out_invite {
        for header in &invite.headers {
            if let TypedHeader::From(_) | TypedHeader::CallId(_) = header {
                builder = builder.header(header.clone());
            }
        }
    }
    builder = builder.header(TypedHeader::CSeq(rvoip_sip_core::CSeq::new(
        dialog.local_cseq + 1,
        Method::Bye,
    )));
    Some(builder.build())
}
