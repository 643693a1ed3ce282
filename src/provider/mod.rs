//! The dispatcher: transaction registry, dialog registry, and auth-context
//! cache tied together behind one inbound/outbound entry point (§4.6).
//!
//! Grounded in the teacher's `dialog-core` manager split
//! (`manager::dialog_operations`/`manager::message_routing`): a single owner
//! holds `DashMap`-backed registries plus a background pump that drains every
//! spawned transaction's `TransactionEvent`s, removing a transaction from the
//! registry the moment it reports `Terminated` rather than waiting for a
//! sweep.

pub mod auth_context;
pub mod dispatch;

use std::sync::Arc;

use dashmap::DashMap;
use rvoip_sip_core::types::{Param, TypedHeader};
use rvoip_sip_core::{
    Authorization, CallId, Challenge, Credentials, From as FromHeader, Message, Method,
    ProxyAuthorization, Request, Response, Via,
};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::auth::{compute_response, DigestChallenge, DigestCredentials};
use crate::config::StackConfig;
use crate::dialog::{DialogEvent, DialogRegistry};
use crate::error::Result;
use crate::transaction::client_invite::ClientInviteTransaction;
use crate::transaction::client_noninvite::ClientNonInviteTransaction;
use crate::transaction::server_invite::ServerInviteTransaction;
use crate::transaction::server_noninvite::ServerNonInviteTransaction;
use crate::transaction::{
    InternalTransactionCommand, Transaction, TransactionEvent, TransactionKey, TransactionState,
};
use crate::transport::branch::{compute_branch, BranchInputs};
use crate::transport::Channel;

use auth_context::{policy_allows, AuthContext, AuthRequestedCallback};
use dispatch::MatchKey;

/// Union of the four transaction variants the registry holds, so lookups
/// don't need to know which state machine matched.
enum AnyTransaction {
    ClientInvite(Arc<ClientInviteTransaction>),
    ClientNonInvite(Arc<ClientNonInviteTransaction>),
    ServerInvite(Arc<ServerInviteTransaction>),
    ServerNonInvite(Arc<ServerNonInviteTransaction>),
}

impl AnyTransaction {
    fn as_transaction(&self) -> &dyn Transaction {
        match self {
            AnyTransaction::ClientInvite(t) => t.as_ref(),
            AnyTransaction::ClientNonInvite(t) => t.as_ref(),
            AnyTransaction::ServerInvite(t) => t.as_ref(),
            AnyTransaction::ServerNonInvite(t) => t.as_ref(),
        }
    }

    async fn send_command(&self, command: InternalTransactionCommand) {
        let sender = match self {
            AnyTransaction::ClientInvite(t) => t.command_sender(),
            AnyTransaction::ClientNonInvite(t) => t.command_sender(),
            AnyTransaction::ServerInvite(t) => t.command_sender(),
            AnyTransaction::ServerNonInvite(t) => t.command_sender(),
        };
        let _ = sender.send(command).await;
    }
}

/// Everything the application can observe from the provider: transaction
/// lifecycle events plus dialog lifecycle events, plus a request that
/// arrived with no matching transaction at all (a new dialog-creating
/// request, or an in-dialog request whose server txn already terminated).
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    Transaction(TransactionEvent),
    Dialog(DialogEvent),
    UnmatchedRequest { request: Request, source: std::net::SocketAddr },
}

/// Outcome of feeding one inbound message through the dispatch algorithm,
/// returned synchronously to the caller (the listening point's receive
/// loop) in addition to whatever events were pushed to the provider's event
/// channel.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Rule 3: forwarded to an existing server transaction.
    ForwardedToServerTransaction(TransactionKey),
    /// Rule 5: forwarded to an existing client transaction.
    ForwardedToClientTransaction(TransactionKey),
    /// Rule 4: an ACK or in-dialog request matched a dialog.
    ForwardedToDialog,
    /// No txn, no dialog: surfaced to the application as a fresh request.
    Unmatched,
}

pub struct Provider {
    config: StackConfig,
    transactions: DashMap<TransactionKey, AnyTransaction>,
    dialogs: DialogRegistry,
    /// Keyed by (Call-ID, realm) per §4.6 "Challenge caching".
    auth_contexts: DashMap<(String, String), AuthContext>,
    auth_callback: Mutex<Option<AuthRequestedCallback>>,
    txn_events_tx: mpsc::Sender<TransactionEvent>,
    events_tx: mpsc::Sender<ProviderEvent>,
}

impl Provider {
    /// Builds a provider and spawns its transaction-event pump. The
    /// returned receiver is the application's single feed of
    /// `ProviderEvent`s.
    pub fn new(config: StackConfig) -> (Arc<Self>, mpsc::Receiver<ProviderEvent>) {
        let (txn_events_tx, mut txn_events_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(256);

        let provider = Arc::new(Provider {
            config,
            transactions: DashMap::new(),
            dialogs: DialogRegistry::new(),
            auth_contexts: DashMap::new(),
            auth_callback: Mutex::new(None),
            txn_events_tx,
            events_tx,
        });

        let pump_provider = provider.clone();
        tokio::spawn(async move {
            while let Some(event) = txn_events_rx.recv().await {
                if let TransactionEvent::Terminated { id } = &event {
                    pump_provider.transactions.remove(id);
                }
                let _ = pump_provider.events_tx.send(ProviderEvent::Transaction(event)).await;
            }
        });

        (provider, events_rx)
    }

    pub fn dialogs(&self) -> &DialogRegistry {
        &self.dialogs
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub async fn set_auth_requested_callback(&self, callback: AuthRequestedCallback) {
        *self.auth_callback.lock().await = Some(callback);
    }

    fn events_tx(&self) -> mpsc::Sender<ProviderEvent> {
        self.events_tx.clone()
    }

    // ---- transaction registration ----------------------------------------

    pub fn register_client_invite(&self, key: TransactionKey, request: Request, channel: Arc<Channel>) -> Arc<ClientInviteTransaction> {
        let txn = ClientInviteTransaction::spawn(key.clone(), request, channel, self.config.clone(), self.txn_events_tx.clone());
        self.transactions.insert(key, AnyTransaction::ClientInvite(txn.clone()));
        txn
    }

    pub fn register_client_noninvite(&self, key: TransactionKey, request: Request, channel: Arc<Channel>) -> Arc<ClientNonInviteTransaction> {
        let txn = ClientNonInviteTransaction::spawn(key.clone(), request, channel, self.config.clone(), self.txn_events_tx.clone());
        self.transactions.insert(key, AnyTransaction::ClientNonInvite(txn.clone()));
        txn
    }

    pub fn register_server_invite(
        &self,
        key: TransactionKey,
        request: Request,
        channel: Arc<Channel>,
        auto_trying: bool,
    ) -> Arc<ServerInviteTransaction> {
        let txn = ServerInviteTransaction::spawn(key.clone(), request, channel, self.config.clone(), self.txn_events_tx.clone(), auto_trying);
        self.transactions.insert(key, AnyTransaction::ServerInvite(txn.clone()));
        txn
    }

    pub fn register_server_noninvite(&self, key: TransactionKey, channel: Arc<Channel>) -> Arc<ServerNonInviteTransaction> {
        let txn = ServerNonInviteTransaction::spawn(key.clone(), channel, self.config.clone(), self.txn_events_tx.clone());
        self.transactions.insert(key, AnyTransaction::ServerNonInvite(txn.clone()));
        txn
    }

    /// Sends a brand new request, computing a fresh RFC 3261 branch, adding
    /// the Via header, auto-filling any cached credentials for this Call-ID,
    /// and spawning the matching client transaction (§4.1 "Via header
    /// fixup", §4.6 "Authorization auto-fill").
    pub async fn send_request(&self, mut request: Request, channel: Arc<Channel>, via_host: &str, via_port: Option<u16>) -> Result<TransactionKey> {
        let previous_via = request.typed_header::<Via>().map(|v| v.to_string()).unwrap_or_default();
        let from_tag = request.typed_header::<FromHeader>().and_then(|f| f.tag()).unwrap_or("").to_string();
        let call_id = request.typed_header::<CallId>().map(|c| c.to_string()).unwrap_or_default();
        let cseq_number = request.typed_header::<rvoip_sip_core::CSeq>().map(|c| c.seq).unwrap_or(0);

        let branch = compute_branch(&BranchInputs {
            request_uri: &request.uri().to_string(),
            from_tag: &from_tag,
            to_tag: "",
            call_id: &call_id,
            cseq_number,
            previous_via: &previous_via,
        });

        let transport_name = match channel.peer().transport() {
            crate::hop::TransportKind::Udp => "UDP",
            crate::hop::TransportKind::Tcp => "TCP",
            crate::hop::TransportKind::Tls => "TLS",
        };
        let via = Via::new("SIP", "2.0", transport_name, via_host, via_port, vec![Param::branch(branch.clone())])
            .map_err(|e| crate::error::Error::Message(e.to_string()))?;
        request = request.with_header(TypedHeader::Via(via));

        self.apply_auth_autofill(&call_id, &mut request).await;

        let method = request.method.clone();
        let key = TransactionKey::new(branch, method.clone(), false);

        if method == Method::Invite {
            self.register_client_invite(key.clone(), request, channel);
        } else {
            self.register_client_noninvite(key.clone(), request, channel);
        }
        Ok(key)
    }

    /// Like [`Self::send_request`] but for a non-INVITE request the caller
    /// wants to await directly (REGISTER/SUBSCRIBE refresh), returning the
    /// spawned transaction itself rather than just its key so the caller can
    /// `wait_final()` on it without going through the shared event feed.
    pub async fn send_tracked_request(
        &self,
        mut request: Request,
        channel: Arc<Channel>,
        via_host: &str,
        via_port: Option<u16>,
    ) -> Result<Arc<ClientNonInviteTransaction>> {
        let previous_via = request.typed_header::<Via>().map(|v| v.to_string()).unwrap_or_default();
        let from_tag = request.typed_header::<FromHeader>().and_then(|f| f.tag()).unwrap_or("").to_string();
        let call_id = request.typed_header::<CallId>().map(|c| c.to_string()).unwrap_or_default();
        let cseq_number = request.typed_header::<rvoip_sip_core::CSeq>().map(|c| c.seq).unwrap_or(0);

        let branch = compute_branch(&BranchInputs {
            request_uri: &request.uri().to_string(),
            from_tag: &from_tag,
            to_tag: "",
            call_id: &call_id,
            cseq_number,
            previous_via: &previous_via,
        });

        let transport_name = match channel.peer().transport() {
            crate::hop::TransportKind::Udp => "UDP",
            crate::hop::TransportKind::Tcp => "TCP",
            crate::hop::TransportKind::Tls => "TLS",
        };
        let via = Via::new("SIP", "2.0", transport_name, via_host, via_port, vec![Param::branch(branch.clone())])
            .map_err(|e| crate::error::Error::Message(e.to_string()))?;
        request = request.with_header(TypedHeader::Via(via));

        self.apply_auth_autofill(&call_id, &mut request).await;

        let method = request.method.clone();
        let key = TransactionKey::new(branch, method, false);
        Ok(self.register_client_noninvite(key, request, channel))
    }

    /// Adds an `Authorization`/`Proxy-Authorization` header for every cached,
    /// non-exhausted auth context on this Call-ID (§4.6 "Authorization
    /// auto-fill").
    async fn apply_auth_autofill(&self, call_id: &str, request: &mut Request) {
        let callback = self.auth_callback.lock().await.clone();
        let Some(callback) = callback else { return };

        let realms: Vec<String> = self
            .auth_contexts
            .iter()
            .filter(|entry| entry.key().0 == call_id)
            .map(|entry| entry.key().1.clone())
            .collect();

        for realm in realms {
            let key = (call_id.to_string(), realm.clone());
            let Some(mut ctx) = self.auth_contexts.get_mut(&key).map(|e| e.value().clone()) else { continue };
            if ctx.failures_exhausted() {
                continue;
            }
            let Some(creds) = callback(&realm) else { continue };

            let nonce_count = ctx.next_nonce_count();
            self.auth_contexts.insert(key, ctx.clone());

            let digest_creds = DigestCredentials { username: creds.username, realm: realm.clone(), password: creds.password, ha1: creds.ha1 };
            let uri_str = request.uri().to_string();
            let method_str = request.method.to_string();

            match compute_response(
                &ctx.challenge,
                &digest_creds,
                &method_str,
                &uri_str,
                nonce_count,
                self.config.digest_auth_policy.allow_md5,
                self.config.digest_auth_policy.allow_no_qop,
            ) {
                Ok(response) => {
                    let params = digest_params(&response);
                    let credentials = Credentials::Digest { params };
                    let header = if ctx.is_proxy {
                        TypedHeader::ProxyAuthorization(ProxyAuthorization(vec![credentials]))
                    } else {
                        TypedHeader::Authorization(Authorization(credentials))
                    };
                    *request = request.clone().with_header(header);
                }
                Err(e) => warn!(error = %e, realm, "failed to compute digest response for auto-fill"),
            }
        }
    }

    // ---- inbound dispatch (§4.6) ------------------------------------------

    pub async fn handle_inbound(&self, message: Message, source: std::net::SocketAddr) -> DispatchOutcome {
        match message {
            Message::Request(request) => self.dispatch_request(request, source).await,
            Message::Response(response) => self.dispatch_response(response).await,
        }
    }

    async fn dispatch_request(&self, request: Request, source: std::net::SocketAddr) -> DispatchOutcome {
        let match_key = dispatch::request_match_key(&request);
        let branch = match &match_key {
            MatchKey::Branch(b) => b.clone(),
            MatchKey::Rfc2543(k) => k.clone(),
        };

        // Rule 1/3: ACK matches an INVITE server transaction by branch alone.
        if request.method == Method::Ack {
            if let Some(entry) = self.transactions.iter().find(|e| e.key().matches_ack_for_invite(&branch)) {
                let key = entry.key().clone();
                drop(entry);
                if let Some(txn) = self.transactions.get(&key) {
                    txn.send_command(InternalTransactionCommand::RequestReceived(request)).await;
                    return DispatchOutcome::ForwardedToServerTransaction(key);
                }
            }
        }

        let key = TransactionKey::new(branch.clone(), request.method.clone(), true);
        if let Some(txn) = self.transactions.get(&key) {
            txn.send_command(InternalTransactionCommand::RequestReceived(request)).await;
            return DispatchOutcome::ForwardedToServerTransaction(key);
        }

        // Rule 4: no server txn, fall back to dialog matching.
        if let Some(outcome) = self.dispatch_to_dialog(request, source).await {
            return outcome;
        }

        DispatchOutcome::Unmatched
    }

    async fn dispatch_to_dialog(&self, request: Request, source: std::net::SocketAddr) -> Option<DispatchOutcome> {
        let call_id = request.typed_header::<CallId>()?.to_string();
        let from_tag = request.typed_header::<FromHeader>().and_then(|f| f.tag()).map(str::to_string)?;
        let to_tag = request.typed_header::<rvoip_sip_core::To>().and_then(|t| t.tag()).map(str::to_string);

        let handle = match &to_tag {
            Some(to_tag) => self
                .dialogs
                .find_by_triple(&call_id, to_tag, &from_tag)
                .or_else(|| self.dialogs.find_by_triple(&call_id, &from_tag, to_tag))
                .or_else(|| self.dialogs.find_by_call_id(&call_id).into_iter().next()),
            None => self.dialogs.find_by_call_id(&call_id).into_iter().next(),
        }?;

        let id = { handle.lock().await.id };
        if request.method == Method::Ack {
            let mut guard = handle.lock().await;
            guard.update_remote_address(source);
            guard.needs_ack = false;
            drop(guard);
            let _ = self.events_tx().send(ProviderEvent::Dialog(DialogEvent::StateChanged { id, state: crate::dialog::DialogState::Confirmed })).await;
        } else {
            let mut guard = handle.lock().await;
            if guard.validate_and_update_remote_cseq(&request).is_err() {
                return Some(DispatchOutcome::ForwardedToDialog);
            }
            guard.update_remote_address(source);
            drop(guard);
            let _ = self.events_tx().send(ProviderEvent::Dialog(DialogEvent::Request { id, request })).await;
        }
        Some(DispatchOutcome::ForwardedToDialog)
    }

    async fn dispatch_response(&self, response: Response) -> DispatchOutcome {
        let Some(branch) = dispatch::response_branch(&response) else {
            return DispatchOutcome::Unmatched;
        };
        let Some(method) = response.typed_header::<rvoip_sip_core::CSeq>().map(|c| c.method.clone()) else {
            return DispatchOutcome::Unmatched;
        };
        let key = TransactionKey::new(branch, method, false);

        let status = response.status_code();
        if matches!(status, 401 | 403 | 407) {
            self.cache_or_drop_challenge(&response);
        }

        if let Some(txn) = self.transactions.get(&key) {
            txn.send_command(InternalTransactionCommand::ResponseReceived(response)).await;
            return DispatchOutcome::ForwardedToClientTransaction(key);
        }
        DispatchOutcome::Unmatched
    }

    /// §4.6 "on subsequent 401/403/407 with the same Call-ID, the cached
    /// context is dropped (preventing infinite retry loops)": a 403 never
    /// carries a challenge at all, so it always drops; a 401/407 either
    /// seeds a fresh context or, if one already existed for this Call-ID
    /// and realm, replaces it and bumps the failure counter.
    fn cache_or_drop_challenge(&self, response: &Response) {
        let Some(call_id) = response.typed_header::<CallId>().map(|c| c.to_string()) else { return };

        let challenges = extract_challenges(response);
        if challenges.is_empty() {
            self.auth_contexts.retain(|k, _| k.0 != call_id);
            return;
        }

        for (realm, challenge, is_proxy) in challenges {
            let key = (call_id.clone(), realm.clone());
            if !policy_allows(&challenge, self.config.digest_auth_policy.allow_md5, self.config.digest_auth_policy.allow_no_qop) {
                self.auth_contexts.remove(&key);
                continue;
            }
            let mut failures = 0;
            if let Some(existing) = self.auth_contexts.get(&key) {
                failures = existing.consecutive_failures + 1;
            }
            let mut ctx = AuthContext::new(realm, challenge, is_proxy);
            ctx.consecutive_failures = failures;
            self.auth_contexts.insert(key, ctx);
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}

fn digest_params(response: &crate::auth::DigestResponse) -> Vec<rvoip_sip_core::DigestParam> {
    use rvoip_sip_core::DigestParam;

    let mut params = vec![
        DigestParam::Username(response.username.clone()),
        DigestParam::Realm(response.realm.clone()),
        DigestParam::Nonce(response.nonce.clone()),
        DigestParam::Uri(response.uri.parse().expect("digest uri was taken from a parsed request URI")),
        DigestParam::Response(response.response.clone()),
        DigestParam::Algorithm(response.algorithm.clone()),
    ];
    if let Some(opaque) = &response.opaque {
        params.push(DigestParam::Opaque(opaque.clone()));
    }
    if let Some(qop) = &response.qop {
        params.push(DigestParam::MsgQop(qop.clone()));
        if let Some(cnonce) = &response.cnonce {
            params.push(DigestParam::Cnonce(cnonce.clone()));
        }
        if let Some(nc) = response.nonce_count {
            params.push(DigestParam::NonceCount(nc));
        }
    }
    params
}

/// Extracts every Digest challenge from a response's `WWW-Authenticate`/
/// `Proxy-Authenticate` headers as `(realm, challenge, is_proxy)`.
fn extract_challenges(response: &Response) -> Vec<(String, DigestChallenge, bool)> {
    let mut out = Vec::new();
    for header in &response.headers {
        match header {
            TypedHeader::WwwAuthenticate(www) => {
                for challenge in &www.0 {
                    if let Challenge::Digest { params } = challenge {
                        if let Some(c) = DigestChallenge::from_params(params) {
                            out.push((c.realm.clone(), c, false));
                        }
                    }
                }
            }
            TypedHeader::ProxyAuthenticate(proxy) => {
                for challenge in &proxy.0 {
                    if let Challenge::Digest { params } = challenge {
                        if let Some(c) = DigestChallenge::from_params(params) {
                            out.push((c.realm.clone(), c, true));
                        }
                    }
                }
            }
            _ => {}
        }
    }
    out
}
