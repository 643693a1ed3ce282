//! INVITE Server Transaction (IST), RFC 3261 §17.2.1 (§4.4 "INVITE Server").

use std::sync::Arc;

use rvoip_sip_core::{Method, Request, Response, StatusCode};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::transport::Channel;

use super::responses::{build_response, to_tag_for_request};
use super::{
    timer, AtomicTransactionState, CommandReceiver, CommandSender, InternalTransactionCommand,
    Transaction, TransactionEvent, TransactionKey, TransactionState,
};
use crate::config::StackConfig;

pub struct ServerInviteTransaction {
    id: TransactionKey,
    state: Arc<AtomicTransactionState>,
    last_response: Arc<Mutex<Option<Response>>>,
    cmd_tx: CommandSender,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServerInviteTransaction {
    /// Spawns the transaction and immediately fires the automatic 100
    /// Trying (§4.4 "automatic provisional"), unless `auto_trying` is false
    /// (an application that wants to answer with its own first provisional
    /// before 200ms can suppress it).
    pub fn spawn(
        id: TransactionKey,
        request: Request,
        channel: Arc<Channel>,
        config: StackConfig,
        events_tx: mpsc::Sender<TransactionEvent>,
        auto_trying: bool,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let state = Arc::new(AtomicTransactionState::new(TransactionState::Proceeding));
        let last_response = Arc::new(Mutex::new(None));

        let txn = Arc::new(ServerInviteTransaction {
            id: id.clone(),
            state: state.clone(),
            last_response: last_response.clone(),
            cmd_tx,
            loop_handle: Mutex::new(None),
        });

        let handle = tokio::spawn(run_loop(
            id,
            state,
            Arc::new(request),
            last_response,
            channel,
            config,
            events_tx,
            cmd_rx,
            auto_trying,
        ));
        let txn_for_handle = txn.clone();
        tokio::spawn(async move {
            *txn_for_handle.loop_handle.lock().await = Some(handle);
        });

        txn
    }

    pub fn command_sender(&self) -> CommandSender {
        self.cmd_tx.clone()
    }

    pub async fn last_response(&self) -> Option<Response> {
        self.last_response.lock().await.clone()
    }
}

impl Transaction for ServerInviteTransaction {
    fn id(&self) -> &TransactionKey {
        &self.id
    }

    fn state(&self) -> TransactionState {
        self.state.load()
    }

    fn is_server(&self) -> bool {
        true
    }
}

async fn run_loop(
    id: TransactionKey,
    state: Arc<AtomicTransactionState>,
    request: Arc<Request>,
    last_response: Arc<Mutex<Option<Response>>>,
    channel: Arc<Channel>,
    config: StackConfig,
    events_tx: mpsc::Sender<TransactionEvent>,
    mut cmd_rx: CommandReceiver,
    auto_trying: bool,
) {
    let reliable = channel.is_reliable();
    let to_tag = to_tag_for_request(&request);

    if auto_trying {
        let trying = build_response(&request, StatusCode::Trying, &to_tag);
        let _ = channel
            .send(rvoip_sip_core::Message::Response(trying.clone()))
            .await;
        *last_response.lock().await = Some(trying);
    }

    // Timer G (response retransmit, unreliable only), started once COMPLETED.
    let mut retransmit_attempt = 0u32;
    let mut retransmit_deadline: Option<tokio::time::Instant> = None;
    // Timer H (wait for ACK) / Timer I (wait after ACK) / Timer L (wait in ACCEPTED).
    let mut terminal_deadline: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            _ = super::sleep_until_opt(retransmit_deadline), if retransmit_deadline.is_some() => {
                if matches!(state.load(), TransactionState::Completed) {
                    retransmit_attempt += 1;
                    if let Some(response) = last_response.lock().await.clone() {
                        let _ = channel.send(rvoip_sip_core::Message::Response(response)).await;
                    }
                    let wait = timer::response_retransmit_interval(&config, retransmit_attempt);
                    retransmit_deadline = Some(tokio::time::Instant::now() + wait);
                } else {
                    retransmit_deadline = None;
                }
            }
            _ = super::sleep_until_opt(terminal_deadline) => {
                match state.load() {
                    TransactionState::Completed => {
                        // Timer H fired: no ACK arrived.
                        let _ = events_tx.send(TransactionEvent::Timeout { id: id.clone() }).await;
                        terminate(&id, &state, &events_tx).await;
                        return;
                    }
                    TransactionState::Confirmed | TransactionState::Accepted => {
                        terminate(&id, &state, &events_tx).await;
                        return;
                    }
                    _ => {}
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(InternalTransactionCommand::RequestReceived(req)) => {
                        if matches!(req.method, Method::Ack) {
                            if matches!(state.load(), TransactionState::Completed) {
                                state.store(TransactionState::Confirmed);
                                let _ = events_tx.send(TransactionEvent::AckReceived { id: id.clone(), request: req }).await;
                                retransmit_deadline = None;
                                let wait = timer::wait_after_ack(&config, reliable);
                                terminal_deadline = Some(tokio::time::Instant::now() + wait);
                            }
                        } else {
                            // Retransmitted INVITE: resend the last provisional/final response.
                            if let Some(response) = last_response.lock().await.clone() {
                                let _ = channel.send(rvoip_sip_core::Message::Response(response)).await;
                            }
                        }
                    }
                    Some(InternalTransactionCommand::SendResponse(response)) => {
                        let status = response.status_code();
                        *last_response.lock().await = Some(response.clone());
                        let _ = channel
                            .send(rvoip_sip_core::Message::Response(response.clone()))
                            .await;

                        if (100..200).contains(&status) {
                            state.store(TransactionState::Proceeding);
                        } else if (200..300).contains(&status) {
                            state.store(TransactionState::Accepted);
                            let wait = timer::wait_in_accepted(&config);
                            terminal_deadline = Some(tokio::time::Instant::now() + wait);
                            let _ = events_tx
                                .send(TransactionEvent::FinalResponse { id: id.clone(), response })
                                .await;
                        } else {
                            state.store(TransactionState::Completed);
                            if !reliable {
                                retransmit_attempt = 0;
                                let wait = timer::response_retransmit_interval(&config, 0);
                                retransmit_deadline = Some(tokio::time::Instant::now() + wait);
                            }
                            let wait = timer::wait_for_ack(&config);
                            terminal_deadline = Some(tokio::time::Instant::now() + wait);
                            let _ = events_tx
                                .send(TransactionEvent::FinalResponse { id: id.clone(), response })
                                .await;
                        }
                    }
                    Some(InternalTransactionCommand::ResponseReceived(_)) => {}
                    Some(InternalTransactionCommand::Terminate) | None => {
                        terminate(&id, &state, &events_tx).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn terminate(
    id: &TransactionKey,
    state: &AtomicTransactionState,
    events_tx: &mpsc::Sender<TransactionEvent>,
) {
    state.store(TransactionState::Terminated);
    let _ = events_tx
        .send(TransactionEvent::Terminated { id: id.clone() })
        .await;
}

impl Drop for ServerInviteTransaction {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.loop_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvoip_sip_core::builder::RequestBuilder;
    use rvoip_sip_core::types::{Address, CSeq, CallId, From as FromHeader, To, TypedHeader, Uri};

    fn sample_invite() -> Request {
        let from_addr = Address::new("sip:alice@example.com".parse::<Uri>().unwrap());
        let to_addr = Address::new("sip:bob@example.org".parse::<Uri>().unwrap());
        RequestBuilder::new(Method::Invite, "sip:bob@example.org")
            .unwrap()
            .header(TypedHeader::From(FromHeader::new(from_addr)))
            .header(TypedHeader::To(To::new(to_addr)))
            .header(TypedHeader::CallId(CallId::new("call-1@host")))
            .header(TypedHeader::CSeq(CSeq::new(1, Method::Invite)))
            .build()
    }

    #[test]
    fn to_tag_is_deterministic_and_six_hex_chars() {
        let request = sample_invite();
        let a = to_tag_for_request(&request);
        let b = to_tag_for_request(&request);
        assert_eq!(a, b);
        assert_eq!(a.len(), 6);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn build_response_tags_the_to_header() {
        let request = sample_invite();
        let tag = to_tag_for_request(&request);
        let response = build_response(&request, StatusCode::Trying, &tag);
        let to = response.typed_header::<To>().unwrap();
        assert_eq!(to.tag(), Some(tag.as_str()));
    }
}
