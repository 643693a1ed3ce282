//! RFC 3261 §17 transaction state machines (§3 "Transaction (base)", §4.4).
//!
//! Grounded in the teacher's `transaction-core`/`dialog-core` split: each
//! transaction owns a `state: Arc<AtomicTransactionState>`-style handle, a
//! `cmd_tx`/`cmd_rx` command channel driving its event loop, and an
//! `events_tx` feeding `TransactionEvent`s to the provider, with a
//! `JoinHandle` aborted on `Drop` so a transaction never outlives the last
//! strong reference to it.

pub mod client_invite;
pub mod client_noninvite;
pub mod key;
pub mod responses;
pub mod server_invite;
pub mod server_noninvite;
pub mod timer;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use rvoip_sip_core::{Request, Response};
use tokio::sync::mpsc;

pub use key::TransactionKey;

/// §3 "Transaction (base)" state set, shared across all four variants (not
/// every state is reachable by every variant: NICT/NIST never see CALLING or
/// ACCEPTED, for instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionState {
    Init = 0,
    Trying = 1,
    Calling = 2,
    Proceeding = 3,
    Completed = 4,
    Confirmed = 5,
    Accepted = 6,
    Terminated = 7,
}

/// An atomically stored [`TransactionState`], mirroring the teacher's
/// `Arc<AtomicTransactionState>` field on its transaction `data` structs.
#[derive(Debug, Default)]
pub struct AtomicTransactionState(AtomicU8);

impl AtomicTransactionState {
    pub fn new(state: TransactionState) -> Self {
        AtomicTransactionState(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> TransactionState {
        match self.0.load(Ordering::SeqCst) {
            0 => TransactionState::Init,
            1 => TransactionState::Trying,
            2 => TransactionState::Calling,
            3 => TransactionState::Proceeding,
            4 => TransactionState::Completed,
            5 => TransactionState::Confirmed,
            6 => TransactionState::Accepted,
            _ => TransactionState::Terminated,
        }
    }

    pub fn store(&self, state: TransactionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Notifications a transaction surfaces to the provider (§4.4 "notify").
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    StateChanged {
        id: TransactionKey,
        state: TransactionState,
    },
    ProvisionalResponse {
        id: TransactionKey,
        response: Response,
    },
    FinalResponse {
        id: TransactionKey,
        response: Response,
    },
    /// Fired once per IST when the application must observe the ACK itself
    /// (§4.4 "application is responsible for ACK observation").
    AckReceived {
        id: TransactionKey,
        request: Request,
    },
    Timeout {
        id: TransactionKey,
    },
    TransportError {
        id: TransactionKey,
        error: String,
    },
    /// On entering TERMINATED the provider removes the transaction from its
    /// registry (§4.4 "all four share").
    Terminated {
        id: TransactionKey,
    },
}

/// Commands fed into a transaction's event loop from the outside (an
/// inbound response/request the provider matched to this transaction, or an
/// explicit instruction). Named after the teacher's
/// `InternalTransactionCommand`.
#[derive(Debug)]
pub enum InternalTransactionCommand {
    ResponseReceived(Response),
    RequestReceived(Request),
    /// Application submits a response on a server transaction (§4.4 "TU
    /// sends a response"). No-op on client transactions.
    SendResponse(Response),
    Terminate,
}

pub type CommandSender = mpsc::Sender<InternalTransactionCommand>;
pub type CommandReceiver = mpsc::Receiver<InternalTransactionCommand>;

/// Shared read-only accessors every transaction variant exposes.
pub trait Transaction: Send + Sync {
    fn id(&self) -> &TransactionKey;
    fn state(&self) -> TransactionState;
    fn is_server(&self) -> bool;
}

/// Waits until `deadline`, or forever if none is set yet. Used by every
/// run loop to fold an optional "wait-after-completed" timer (D/I/J/K) into
/// the same `tokio::select!` as the always-present retransmit/timeout arms.
pub(crate) async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending().await,
    }
}
