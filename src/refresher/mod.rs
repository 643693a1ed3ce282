//! Automatic re-sending engine for time-bound requests (§3 "Refresher",
//! §4.7), grounded in belle-sip's `refresher.c`: a refresher attaches to a
//! just-sent REGISTER/SUBSCRIBE/PUBLISH, tracks the target and obtained
//! expiry, and re-issues the request before it lapses, replaying
//! authentication and following redirects along the way.

use std::sync::Arc;
use std::time::Duration;

use rvoip_sip_core::types::{Param, TypedHeader};
use rvoip_sip_core::{CSeq, Expires, Request, Response, Uri};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::StackConfig;
use crate::provider::Provider;
use crate::transport::Channel;

/// Status the refresher surfaces to the application (§4.7 "listener
/// callback"). `AboutToExpire` is the manual-mode "status code 0" event;
/// the application must call [`Refresher::refresh`] in response or the
/// registration lapses.
#[derive(Debug, Clone)]
pub enum RefresherEvent {
    Refreshed { expires: u32 },
    AboutToExpire,
    Failed { status: u16, reason: String },
}

enum RefresherCommand {
    Refresh(Option<u32>),
    Stop,
    SetManual(bool),
    SetRetryAfter(Duration),
}

/// Which timer fired: only a `Normal`-purpose fire is subject to manual-mode
/// gating (§4.7 "Manual mode"); a `Retry`-purpose fire always runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerPurpose {
    Normal,
    Retry,
}

/// State owned solely by the refresher's task; never shared, so it needs no
/// lock even though the run loop awaits across its mutations.
struct RunState {
    base_request: Request,
    via_host: String,
    via_port: Option<u16>,
    target_expires: i64,
    obtained_expires: i64,
    auth_failures: u32,
    number_of_retry: u32,
    manual: bool,
    retry_after: Duration,
    redirect_uri: Option<Uri>,
}

/// Handle to a running refresher, mirroring the transaction structs' shape:
/// a command channel into the task plus a `JoinHandle` aborted on `Drop`.
pub struct Refresher {
    cmd_tx: mpsc::Sender<RefresherCommand>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Refresher {
    /// Spawns a refresher for `request` (already sent once by the caller),
    /// attaching to `provider`/`channel` for every subsequent resend.
    /// `target_expires` is the value the application wants to keep renewing;
    /// 0 means "never auto-refresh, but still report the outcome of manual
    /// `refresh()` calls".
    pub fn spawn(
        request: Request,
        channel: Arc<Channel>,
        provider: Arc<Provider>,
        config: StackConfig,
        via_host: impl Into<String>,
        via_port: Option<u16>,
        target_expires: u32,
        events_tx: mpsc::Sender<RefresherEvent>,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);

        let state = RunState {
            base_request: request,
            via_host: via_host.into(),
            via_port,
            target_expires: target_expires as i64,
            obtained_expires: target_expires as i64,
            auth_failures: 0,
            number_of_retry: 0,
            manual: false,
            retry_after: config.refresher_retry_after,
            redirect_uri: None,
        };

        let refresher = Arc::new(Refresher {
            cmd_tx,
            loop_handle: Mutex::new(None),
        });

        let handle = tokio::spawn(run(state, channel, provider, config, cmd_rx, events_tx));
        let refresher_for_handle = refresher.clone();
        tokio::spawn(async move {
            *refresher_for_handle.loop_handle.lock().await = Some(handle);
        });

        refresher
    }

    /// Explicitly triggers a refresh now, optionally adopting a new target
    /// expiry. Used both by the application (manual mode) and by tests.
    pub async fn refresh(&self, new_expires: Option<u32>) {
        let _ = self.cmd_tx.send(RefresherCommand::Refresh(new_expires)).await;
    }

    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(RefresherCommand::Stop).await;
    }

    pub async fn set_manual_mode(&self, manual: bool) {
        let _ = self.cmd_tx.send(RefresherCommand::SetManual(manual)).await;
    }

    pub async fn set_retry_after(&self, retry_after: Duration) {
        let _ = self.cmd_tx.send(RefresherCommand::SetRetryAfter(retry_after)).await;
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.loop_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// What the run loop should do next, decided by [`perform_refresh`] after
/// each attempt.
enum NextAction {
    /// Arm a timer of this purpose/delay and keep going.
    Schedule(TimerPurpose, Duration),
    /// target_expires reached 0, or an unrecoverable failure: stop for good.
    Stop,
}

async fn sleep_opt(delay: Option<Duration>) {
    match delay {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn run(
    mut state: RunState,
    channel: Arc<Channel>,
    provider: Arc<Provider>,
    config: StackConfig,
    mut cmd_rx: mpsc::Receiver<RefresherCommand>,
    events_tx: mpsc::Sender<RefresherEvent>,
) {
    let mut next = perform_refresh(&mut state, &channel, &provider, &config, &events_tx).await;

    loop {
        let delay = match &next {
            NextAction::Schedule(_, delay) => Some(*delay),
            NextAction::Stop => None,
        };

        tokio::select! {
            _ = sleep_opt(delay) => {
                let purpose = match &next {
                    NextAction::Schedule(p, _) => *p,
                    NextAction::Stop => unreachable!(),
                };
                if purpose == TimerPurpose::Normal && state.manual {
                    let _ = events_tx.send(RefresherEvent::AboutToExpire).await;
                    next = NextAction::Stop;
                } else {
                    next = perform_refresh(&mut state, &channel, &provider, &config, &events_tx).await;
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RefresherCommand::Refresh(new_expires)) => {
                        if let Some(e) = new_expires {
                            state.target_expires = e as i64;
                        }
                        next = perform_refresh(&mut state, &channel, &provider, &config, &events_tx).await;
                    }
                    Some(RefresherCommand::SetManual(manual)) => state.manual = manual,
                    Some(RefresherCommand::SetRetryAfter(d)) => state.retry_after = d,
                    Some(RefresherCommand::Stop) | None => return,
                }
            }
        }
    }
}

/// Builds the refresh request, sends it, and decides what happens next —
/// the Rust shape of belle-sip's `belle_sip_refresher_refresh_internal` plus
/// `process_response_event`/`process_timeout`/`process_io_error`.
async fn perform_refresh(
    state: &mut RunState,
    channel: &Arc<Channel>,
    provider: &Arc<Provider>,
    config: &StackConfig,
    events_tx: &mpsc::Sender<RefresherEvent>,
) -> NextAction {
    let request = build_refresh_request(state);

    let txn = match provider
        .send_tracked_request(request.clone(), channel.clone(), &state.via_host, state.via_port)
        .await
    {
        Ok(txn) => txn,
        Err(e) => {
            warn!(error = %e, "refresher failed to send request");
            let _ = events_tx.send(RefresherEvent::Failed { status: 0, reason: e.to_string() }).await;
            return retry_after_io_error(state);
        }
    };

    let Some(response) = txn.wait_final().await else {
        let _ = events_tx.send(RefresherEvent::Failed { status: 408, reason: "no final response".into() }).await;
        return retry_after_io_error(state);
    };

    let status = response.status_code();
    debug!(status, "refresher got response");

    match status {
        200..=299 => {
            state.auth_failures = 0;
            state.number_of_retry = 0;
            state.redirect_uri = None;
            state.obtained_expires = set_expires_from_response(&request, &response, state.target_expires);
            let _ = events_tx.send(RefresherEvent::Refreshed { expires: state.obtained_expires.max(0) as u32 }).await;

            if state.target_expires <= 0 {
                return NextAction::Stop;
            }
            if !contact_address_accurate(&request, channel).await {
                return NextAction::Schedule(TimerPurpose::Retry, Duration::ZERO);
            }
            let delay_secs = state.obtained_expires.max(0) as f64 * config.refresh_window_max as f64;
            NextAction::Schedule(TimerPurpose::Normal, Duration::from_secs_f64(delay_secs.max(0.0)))
        }
        301 | 302 => {
            state.redirect_uri = extract_redirect_contact(&response);
            NextAction::Schedule(TimerPurpose::Retry, Duration::ZERO)
        }
        401 | 407 => {
            state.auth_failures += 1;
            if state.auth_failures > 3 {
                let _ = events_tx
                    .send(RefresherEvent::Failed { status, reason: "auth failures exhausted".into() })
                    .await;
                if state.target_expires > 0 {
                    return retry_after_failure(state);
                }
                return NextAction::Stop;
            }
            NextAction::Schedule(TimerPurpose::Retry, Duration::ZERO)
        }
        423 => {
            match extract_min_expires(&response) {
                Some(min) if min > 0 => {
                    state.target_expires = min as i64;
                    NextAction::Schedule(TimerPurpose::Retry, Duration::ZERO)
                }
                _ => {
                    let _ = events_tx
                        .send(RefresherEvent::Failed { status, reason: "423 with no usable Min-Expires".into() })
                        .await;
                    NextAction::Stop
                }
            }
        }
        408 | 480 | 503 | 504 => {
            let _ = events_tx.send(RefresherEvent::Failed { status, reason: response_reason(&response) }).await;
            if state.target_expires > 0 {
                retry_after_failure(state)
            } else {
                NextAction::Stop
            }
        }
        _ => {
            let _ = events_tx.send(RefresherEvent::Failed { status, reason: response_reason(&response) }).await;
            NextAction::Stop
        }
    }
}

fn response_reason(response: &Response) -> String {
    format!("{}", response.status_code())
}

/// §4.7 "retry after `retry_after`": always the full configured delay.
fn retry_after_failure(state: &mut RunState) -> NextAction {
    state.number_of_retry += 1;
    NextAction::Schedule(TimerPurpose::Retry, state.retry_after)
}

/// §4.7 "first retry on I/O error after 500 ms": only the very first retry
/// in a run of I/O failures is short; subsequent ones fall back to the full
/// `retry_after`, matching belle-sip's `retry_later_on_io_error`.
fn retry_after_io_error(state: &mut RunState) -> NextAction {
    state.number_of_retry += 1;
    if state.number_of_retry == 1 {
        NextAction::Schedule(TimerPurpose::Retry, Duration::from_millis(500))
    } else {
        NextAction::Schedule(TimerPurpose::Retry, state.retry_after)
    }
}

/// Rebuilds the request to resend: bumps CSeq, applies a pending redirect
/// target (and strips stale auth headers, since they're meaningless against
/// a different destination), strips the previous Via (the provider stamps a
/// fresh one per send), and stamps the current `target_expires`. The result
/// becomes the new `base_request`, so the next call bumps CSeq from what was
/// actually sent rather than re-deriving it from the very first template
/// every time.
fn build_refresh_request(state: &mut RunState) -> Request {
    let mut request = state.base_request.clone();

    let next_seq = request.typed_header::<CSeq>().map(|c| c.seq + 1).unwrap_or(1);
    request.headers.retain(|h| !matches!(h, TypedHeader::CSeq(_)));
    request.headers.push(TypedHeader::CSeq(CSeq::new(next_seq, request.method.clone())));

    request.headers.retain(|h| !matches!(h, TypedHeader::Via(_)));

    if let Some(redirect) = &state.redirect_uri {
        request.uri = redirect.clone();
        request
            .headers
            .retain(|h| !matches!(h, TypedHeader::Authorization(_) | TypedHeader::ProxyAuthorization(_)));
    }

    set_request_expires(&mut request, state.target_expires.max(0) as u32);
    state.base_request = request.clone();
    request
}

/// Stamps `target_expires` on both the top-level `Expires` header and the
/// first Contact entry's `expires` parameter (§4.7, §6 "next outbound
/// request carries Expires: E (or Contact;expires=E)").
fn set_request_expires(request: &mut Request, target_expires: u32) {
    request.headers.retain(|h| !matches!(h, TypedHeader::Expires(_)));
    request.headers.push(TypedHeader::Expires(Expires(target_expires)));

    use rvoip_sip_core::types::contact::ContactValue;

    if let Some(pos) = request.headers.iter().position(|h| matches!(h, TypedHeader::Contact(_))) {
        if let TypedHeader::Contact(contact) = &request.headers[pos] {
            let mut contact = contact.clone();
            if let Some(ContactValue::Params(infos)) = contact.0.first_mut() {
                if let Some(info) = infos.first_mut() {
                    info.address.params.retain(|p| !matches!(p, Param::Expires(_)));
                    info.address.params.push(Param::Expires(target_expires));
                }
            }
            request.headers[pos] = TypedHeader::Contact(contact);
        }
    }
}

/// §4.7 `set_expires_from_trans`: prefer the obtained-expires from the
/// response's Contact entry matching the one we sent, else the response's
/// top-level Expires, else `target_expires`. A server echoing 0 while we
/// asked for a positive value is treated as a bug and ignored.
fn set_expires_from_response(request: &Request, response: &Response, target_expires: i64) -> i64 {
    if let Some(matched) = find_matching_contact_expires(request, response) {
        if matched > 0 || target_expires <= 0 {
            return matched as i64;
        }
    }
    if let Some(header_expires) = response.typed_header::<Expires>() {
        let value = header_expires.0;
        if value > 0 || target_expires <= 0 {
            return value as i64;
        }
    }
    target_expires
}

fn find_matching_contact_expires(request: &Request, response: &Response) -> Option<u32> {
    use rvoip_sip_core::types::contact::ContactValue;

    let sent_uri = request.headers.iter().find_map(|h| match h {
        TypedHeader::Contact(contact) => contact.0.first().and_then(|v| match v {
            ContactValue::Params(infos) => infos.first().map(|i| i.address.uri.to_string()),
            ContactValue::Star => None,
        }),
        _ => None,
    })?;

    response.headers.iter().find_map(|h| match h {
        TypedHeader::Contact(contact) => contact.0.iter().find_map(|v| match v {
            ContactValue::Params(infos) => infos.iter().find_map(|info| {
                if info.address.uri.to_string() != sent_uri {
                    return None;
                }
                info.address.params.iter().find_map(|p| match p {
                    Param::Expires(e) => Some(*e),
                    _ => None,
                })
            }),
            ContactValue::Star => None,
        }),
        _ => None,
    })
}

/// The Min-Expires value off a 423, read without naming the `MinExpires`
/// type (its `Display` impl prints just the delta-seconds integer).
fn extract_min_expires(response: &Response) -> Option<u32> {
    response.headers.iter().find_map(|h| match h {
        TypedHeader::MinExpires(m) => m.to_string().parse::<u32>().ok(),
        _ => None,
    })
}

fn extract_redirect_contact(response: &Response) -> Option<Uri> {
    use rvoip_sip_core::types::contact::ContactValue;

    response.headers.iter().find_map(|h| match h {
        TypedHeader::Contact(contact) => contact.0.iter().find_map(|v| match v {
            ContactValue::Params(infos) => infos.first().map(|info| info.address.uri.clone()),
            ContactValue::Star => None,
        }),
        _ => None,
    })
}

/// §4.7 "Contact address validation": compares the Contact we just sent
/// against the channel's public (ip, port). No recorded public address, or
/// no Contact at all, is treated as accurate (belle-sip's default when it
/// cannot yet tell).
async fn contact_address_accurate(request: &Request, channel: &Arc<Channel>) -> bool {
    use rvoip_sip_core::Host;

    let Some(public) = channel.public_addr().await else { return true };
    let Some(contact_uri) = request.headers.iter().find_map(|h| match h {
        TypedHeader::Contact(contact) => contact.0.first().and_then(|v| match v {
            rvoip_sip_core::types::contact::ContactValue::Params(infos) => {
                infos.first().map(|i| i.address.uri.clone())
            }
            rvoip_sip_core::types::contact::ContactValue::Star => None,
        }),
        _ => None,
    }) else {
        return true;
    };

    let host_matches = match &contact_uri.host {
        Host::Address(ip) => *ip == public.ip(),
        Host::Domain(_) => true,
    };
    let port_matches = contact_uri.port.map(|p| p == public.port()).unwrap_or(true);
    host_matches && port_matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Request {
        rvoip_sip_core::builder::SimpleRequestBuilder::new(rvoip_sip_core::Method::Register, "sip:example.org")
            .unwrap()
            .build()
    }

    #[test]
    fn retry_after_io_error_is_short_once_then_falls_back() {
        let mut state = RunState {
            base_request: sample_request(),
            via_host: "127.0.0.1".into(),
            via_port: None,
            target_expires: 3600,
            obtained_expires: 3600,
            auth_failures: 0,
            number_of_retry: 0,
            manual: false,
            retry_after: Duration::from_millis(60_000),
            redirect_uri: None,
        };

        match retry_after_io_error(&mut state) {
            NextAction::Schedule(TimerPurpose::Retry, d) => assert_eq!(d, Duration::from_millis(500)),
            _ => panic!("expected a retry schedule"),
        }
        match retry_after_io_error(&mut state) {
            NextAction::Schedule(TimerPurpose::Retry, d) => assert_eq!(d, Duration::from_millis(60_000)),
            _ => panic!("expected a retry schedule"),
        }
    }

    #[test]
    fn retry_after_failure_always_uses_full_delay() {
        let mut state = RunState {
            base_request: sample_request(),
            via_host: "127.0.0.1".into(),
            via_port: None,
            target_expires: 3600,
            obtained_expires: 3600,
            auth_failures: 0,
            number_of_retry: 0,
            manual: false,
            retry_after: Duration::from_millis(60_000),
            redirect_uri: None,
        };
        match retry_after_failure(&mut state) {
            NextAction::Schedule(TimerPurpose::Retry, d) => assert_eq!(d, Duration::from_millis(60_000)),
            _ => panic!("expected a retry schedule"),
        }
        assert_eq!(state.number_of_retry, 1);
    }

    #[test]
    fn set_request_expires_stamps_header_and_contact() {
        let mut request = sample_request();
        set_request_expires(&mut request, 1800);
        let header = request.typed_header::<Expires>().expect("expires header present");
        assert_eq!(header.0, 1800);
    }
}
