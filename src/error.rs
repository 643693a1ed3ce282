//! Crate-wide error types.
//!
//! Mirrors the split the teacher crate uses for its own error module
//! (`errors::{dialog_errors, recovery_errors}`): one top-level [`Error`] enum
//! that wraps a focused error type per subsystem, so call sites can match on
//! the subsystem error directly while `?` still composes across module
//! boundaries.
//!
//! Per §7 of the design, none of these unwind across a listener callback —
//! they are always converted to an event (`TransactionEvent`, `DialogEvent`,
//! a refresher status callback, ...) before reaching application code. The
//! `Result` alias here is for synchronous, caller-facing entry points only.

use thiserror::Error;

/// A type alias for handling `Result`s with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Dialog(#[from] DialogError),

    #[error(transparent)]
    Refresher(#[from] RefresherError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("SIP message error: {0}")]
    Message(String),

    #[error("invalid state transition: {0}")]
    ProtocolViolation(String),

    #[error("{0}")]
    Other(String),
}

impl From<rvoip_sip_core::Error> for Error {
    fn from(e: rvoip_sip_core::Error) -> Self {
        Error::Message(e.to_string())
    }
}

/// Channel / listening point failures (§7 `IOError`, `TransportTimeout`, `BadMessage`).
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("channel is not in a state that allows sending ({0})")]
    NotReady(String),

    #[error("DNS resolution failed for {0}")]
    ResolutionFailed(String),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("HTTP CONNECT proxy tunnel failed: {0}")]
    ProxyTunnelFailed(String),

    #[error("reliable transport requires Content-Length; message rejected")]
    MissingContentLength,

    #[error("malformed SIP message on the wire: {0}")]
    BadMessage(String),

    #[error("channel timed out waiting for activity")]
    Timeout,

    #[error("channel already closed")]
    Closed,
}

/// Transaction-layer failures (§7 `TransactionTimeout`, `ProtocolViolation`).
#[derive(Error, Debug, Clone)]
pub enum TransactionError {
    #[error("transaction {0} timed out waiting for a final response")]
    Timeout(String),

    #[error("no transport available to send on transaction {0}")]
    NoTransport(String),

    #[error("invalid transaction state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: String, to: String },

    #[error("transaction {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Dialog-layer failures.
#[derive(Error, Debug, Clone)]
pub enum DialogError {
    #[error("dialog {0} not found")]
    NotFound(String),

    #[error("out-of-order CSeq: got {got}, expected > {expected}")]
    OutOfOrderCSeq { got: u32, expected: u32 },

    #[error("request is missing a required header: {0}")]
    MissingHeader(String),

    #[error("cannot build a dialog from this request/response pair: {0}")]
    NotDialogCreating(String),

    #[error("invalid dialog state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// Refresher failures (§7 `AuthRejected` surfaces through here too).
#[derive(Error, Debug, Clone)]
pub enum RefresherError {
    #[error("refresher exceeded {0} consecutive authentication failures")]
    AuthFailuresExhausted(u32),

    #[error("challenge exceeds configured digest policy")]
    AuthRejected,

    #[error("refresh target has no reachable contact")]
    NoContact,

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Digest authentication failures.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("no cached challenge for this call")]
    NoChallenge,

    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("challenge requires qop=auth but policy disallows it")]
    QopRequired,

    #[error("challenge uses MD5 but policy disallows it")]
    Md5Disallowed,

    #[error("malformed WWW-Authenticate/Proxy-Authenticate header: {0}")]
    MalformedChallenge(String),
}
