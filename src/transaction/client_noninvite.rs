//! non-INVITE Client Transaction (NICT), RFC 3261 §17.1.2 (§4.4 "non-INVITE Client").

use std::sync::Arc;

use rvoip_sip_core::{Request, Response};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::transport::Channel;

use super::{
    timer, AtomicTransactionState, CommandReceiver, CommandSender, InternalTransactionCommand,
    Transaction, TransactionEvent, TransactionKey, TransactionState,
};
use crate::config::StackConfig;

pub struct ClientNonInviteTransaction {
    id: TransactionKey,
    state: Arc<AtomicTransactionState>,
    last_response: Arc<Mutex<Option<Response>>>,
    done: Arc<Notify>,
    cmd_tx: CommandSender,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ClientNonInviteTransaction {
    pub fn spawn(
        id: TransactionKey,
        request: Request,
        channel: Arc<Channel>,
        config: StackConfig,
        events_tx: mpsc::Sender<TransactionEvent>,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let state = Arc::new(AtomicTransactionState::new(TransactionState::Trying));
        let last_response = Arc::new(Mutex::new(None));
        let done = Arc::new(Notify::new());

        let txn = Arc::new(ClientNonInviteTransaction {
            id: id.clone(),
            state: state.clone(),
            last_response: last_response.clone(),
            done: done.clone(),
            cmd_tx,
            loop_handle: Mutex::new(None),
        });

        let handle = tokio::spawn(run_loop(
            id,
            state,
            Arc::new(request),
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

    /// Waits for a non-1xx final response, or `None` if the transaction
    /// times out or is terminated with no final response observed.
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

impl Transaction for ClientNonInviteTransaction {
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
    retransmit.tick().await;

    let timeout_sleep = tokio::time::sleep(timer::timeout(&config));
    tokio::pin!(timeout_sleep);
    let mut completed_deadline: Option<tokio::time::Instant> = None;

    loop {
        let in_trying_or_proceeding = matches!(
            state.load(),
            TransactionState::Trying | TransactionState::Proceeding
        );

        tokio::select! {
            _ = retransmit.tick(), if !reliable && in_trying_or_proceeding => {
                attempt += 1;
                let _ = channel.send(rvoip_sip_core::Message::Request((*request).clone())).await;
                // Timer E continues at a fixed period of T2 once in PROCEEDING.
                let interval = if matches!(state.load(), TransactionState::Proceeding) {
                    config.t2
                } else {
                    timer::retransmit_interval(&config, attempt)
                };
                retransmit = tokio::time::interval(interval);
                retransmit.tick().await;
            }
            _ = &mut timeout_sleep, if in_trying_or_proceeding => {
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
                        let status = response.status_code();
                        *last_response.lock().await = Some(response.clone());
                        if (100..200).contains(&status) {
                            state.store(TransactionState::Proceeding);
                            let _ = events_tx.send(TransactionEvent::ProvisionalResponse { id: id.clone(), response }).await;
                        } else if matches!(state.load(), TransactionState::Completed) {
                            // Retransmitted final response while COMPLETED: absorbed, not forwarded.
                        } else {
                            state.store(TransactionState::Completed);
                            let _ = events_tx.send(TransactionEvent::FinalResponse { id: id.clone(), response }).await;
                            done.notify_waiters();
                            let wait = timer::wait_after_complete(&config, reliable);
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

impl Drop for ClientNonInviteTransaction {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.loop_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
