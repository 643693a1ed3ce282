//! non-INVITE Server Transaction (NIST), RFC 3261 §17.2.2 (§4.4 "non-INVITE Server").

use std::sync::Arc;

use rvoip_sip_core::Response;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::transport::Channel;

use super::{
    timer, AtomicTransactionState, CommandReceiver, CommandSender, InternalTransactionCommand,
    Transaction, TransactionEvent, TransactionKey, TransactionState,
};
use crate::config::StackConfig;

pub struct ServerNonInviteTransaction {
    id: TransactionKey,
    state: Arc<AtomicTransactionState>,
    last_response: Arc<Mutex<Option<Response>>>,
    cmd_tx: CommandSender,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServerNonInviteTransaction {
    pub fn spawn(
        id: TransactionKey,
        channel: Arc<Channel>,
        config: StackConfig,
        events_tx: mpsc::Sender<TransactionEvent>,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let state = Arc::new(AtomicTransactionState::new(TransactionState::Trying));
        let last_response = Arc::new(Mutex::new(None));

        let txn = Arc::new(ServerNonInviteTransaction {
            id: id.clone(),
            state: state.clone(),
            last_response: last_response.clone(),
            cmd_tx,
            loop_handle: Mutex::new(None),
        });

        let handle = tokio::spawn(run_loop(
            id,
            state,
            last_response,
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
}

impl Transaction for ServerNonInviteTransaction {
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
    last_response: Arc<Mutex<Option<Response>>>,
    channel: Arc<Channel>,
    config: StackConfig,
    events_tx: mpsc::Sender<TransactionEvent>,
    mut cmd_rx: CommandReceiver,
) {
    let reliable = channel.is_reliable();
    // Timer J: wait after COMPLETED, started once a final response is sent.
    let mut terminal_deadline: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            _ = super::sleep_until_opt(terminal_deadline) => {
                terminate(&id, &state, &events_tx).await;
                return;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(InternalTransactionCommand::RequestReceived(_)) => {
                        // Retransmitted request: resend whatever was last sent,
                        // if anything (TRYING with nothing sent yet is silent).
                        if let Some(response) = last_response.lock().await.clone() {
                            let _ = channel.send(rvoip_sip_core::Message::Response(response)).await;
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
                        } else {
                            state.store(TransactionState::Completed);
                            let wait = timer::wait_after_nist_complete(&config, reliable);
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

impl Drop for ServerNonInviteTransaction {
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

    #[test]
    fn wait_after_nist_complete_is_zero_on_reliable() {
        let config = StackConfig::default();
        assert_eq!(timer::wait_after_nist_complete(&config, true), std::time::Duration::ZERO);
    }
}
