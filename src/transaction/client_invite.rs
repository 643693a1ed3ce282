//! INVITE Client Transaction (ICT), RFC 3261 §17.1.1 (§4.4 "INVITE Client").

use std::sync::Arc;
use std::time::Duration;

use rvoip_sip_core::{CSeq, Method, Request, Response};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::transport::Channel;

use super::{
    timer, AtomicTransactionState, CommandReceiver, CommandSender, InternalTransactionCommand,
    Transaction, TransactionEvent, TransactionKey, TransactionState,
};
use crate::config::StackConfig;

pub struct ClientInviteTransaction {
    id: TransactionKey,
    state: Arc<AtomicTransactionState>,
    request: Arc<Request>,
    last_response: Arc<Mutex<Option<Response>>>,
    done: Arc<Notify>,
    cmd_tx: CommandSender,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInviteTransaction {
    pub fn spawn(
        id: TransactionKey,
        request: Request,
        channel: Arc<Channel>,
        config: StackConfig,
        events_tx: mpsc::Sender<TransactionEvent>,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let state = Arc::new(AtomicTransactionState::new(TransactionState::Calling));
        let last_response = Arc::new(Mutex::new(None));
        let done = Arc::new(Notify::new());
        let request = Arc::new(request);

        let txn = Arc::new(ClientInviteTransaction {
            id: id.clone(),
            state: state.clone(),
            request: request.clone(),
            last_response: last_response.clone(),
            done: done.clone(),
            cmd_tx,
            loop_handle: Mutex::new(None),
        });

        let handle = tokio::spawn(run_loop(
            id,
            state,
            request,
            last_response,
            done,
            channel,
            config,
            events_tx,
            cmd_rx,
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

    /// Waits for a non-1xx final response, or `None` if the transaction
    /// times out or is terminated with no final response observed. Used by
    /// callers (the refresher, in particular) that need to drive a request
    /// to completion without going through the provider's shared event feed.
    pub async fn wait_final(&self) -> Option<Response> {
        loop {
            if let Some(response) = self.last_response.lock().await.clone() {
                if !(100..200).contains(&response.status_code()) {
                    return Some(response);
                }
            }
            if self.state.load() == TransactionState::Terminated {
                return self.last_response.lock().await.clone();
            }
            self.done.notified().await;
        }
    }
}

impl Transaction for ClientInviteTransaction {
    fn id(&self) -> &TransactionKey {
        &self.id
    }

    fn state(&self) -> TransactionState {
        self.state.load()
    }

    fn is_server(&self) -> bool {
        false
    }
}

async fn run_loop(
    id: TransactionKey,
    state: Arc<AtomicTransactionState>,
    request: Arc<Request>,
    last_response: Arc<Mutex<Option<Response>>>,
    done: Arc<Notify>,
    channel: Arc<Channel>,
    config: StackConfig,
    events_tx: mpsc::Sender<TransactionEvent>,
    mut cmd_rx: CommandReceiver,
) {
    let reliable = channel.is_reliable();
    let _ = channel.send(rvoip_sip_core::Message::Request((*request).clone())).await;

    let mut attempt = 0u32;
    let mut retransmit = tokio::time::interval(timer::retransmit_interval(&config, 0));
    retransmit.tick().await; // consume the immediate first tick

    let timeout_sleep = tokio::time::sleep(timer::timeout(&config));
    tokio::pin!(timeout_sleep);
    let mut completed_deadline: Option<tokio::time::Instant> = None;

    loop {
        let in_calling_or_trying = matches!(
            state.load(),
            TransactionState::Calling | TransactionState::Trying
        );

        tokio::select! {
            _ = retransmit.tick(), if !reliable && in_calling_or_trying => {
                attempt += 1;
                let _ = channel.send(rvoip_sip_core::Message::Request((*request).clone())).await;
                retransmit = tokio::time::interval(timer::retransmit_interval(&config, attempt));
                retransmit.tick().await;
            }
            _ = &mut timeout_sleep, if matches!(state.load(), TransactionState::Calling | TransactionState::Proceeding) => {
                let _ = events_tx.send(TransactionEvent::Timeout { id: id.clone() }).await;
                terminate(&id, &state, &events_tx).await;
                done.notify_waiters();
                return;
            }
            _ = super::sleep_until_opt(completed_deadline) => {
                terminate(&id, &state, &events_tx).await;
                done.notify_waiters();
                return;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(InternalTransactionCommand::ResponseReceived(response)) => {
                        *last_response.lock().await = Some(response.clone());
                        let status = response.status_code();
                        if (100..200).contains(&status) {
                            state.store(TransactionState::Proceeding);
                            let _ = events_tx.send(TransactionEvent::ProvisionalResponse { id: id.clone(), response }).await;
                        } else if (200..300).contains(&status) {
                            state.store(TransactionState::Terminated);
                            let _ = events_tx.send(TransactionEvent::FinalResponse { id: id.clone(), response }).await;
                            terminate(&id, &state, &events_tx).await;
                            done.notify_waiters();
                            return;
                        } else {
                            // 3xx-6xx: build and send ACK, enter COMPLETED, start timer D.
                            let ack = build_ack(&request, &response);
                            let _ = channel.send(rvoip_sip_core::Message::Request(ack)).await;
                            state.store(TransactionState::Completed);
                            let _ = events_tx.send(TransactionEvent::FinalResponse { id: id.clone(), response }).await;
                            done.notify_waiters();
                            let wait = timer::wait_after_final(&config, reliable);
                            completed_deadline = Some(tokio::time::Instant::now() + wait);
                        }
                    }
                    Some(InternalTransactionCommand::Terminate) | None => {
                        terminate(&id, &state, &events_tx).await;
                        done.notify_waiters();
                        return;
                    }
                    Some(InternalTransactionCommand::RequestReceived(_))
                    | Some(InternalTransactionCommand::SendResponse(_)) => {}
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

/// RFC 3261 §17.1.1.3: ACK for non-2xx responses.
fn build_ack(original: &Request, response: &Response) -> Request {
    use rvoip_sip_core::types::TypedHeader;

    let mut ack = Request::new(Method::Ack, original.uri.clone());
    let mut top_via_taken = false;
    for header in &original.headers {
        match header {
            TypedHeader::Via(_) if !top_via_taken => {
                ack = ack.with_header(header.clone());
                top_via_taken = true;
            }
            TypedHeader::CallId(_) | TypedHeader::From(_) | TypedHeader::Route(_) | TypedHeader::Contact(_) => {
                ack = ack.with_header(header.clone());
            }
            _ => {}
        }
    }
    for header in &response.headers {
        if let TypedHeader::To(_) = header {
            ack = ack.with_header(header.clone());
        }
    }
    if let Some(cseq) = original.typed_header::<CSeq>() {
        ack = ack.with_header(TypedHeader::CSeq(CSeq::new(cseq.seq, Method::Ack)));
    }
    ack
}

impl Drop for ClientInviteTransaction {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.loop_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
