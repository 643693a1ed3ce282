//! The per-peer [`Channel`] state machine (§3 "Channel", §4.1).
//!
//! Generalizes the teacher's `UdpTransport`/`UdpTransportInner` split (an
//! `Arc<Inner>` holding the socket plus an `events_tx: mpsc::Sender`) to the
//! full connect/ready/error/disconnected lifecycle, with an outgoing FIFO
//! queue and a single-flight send guard (§4.10 supplement, from belle-sip's
//! serialized `channel_process_data`).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rvoip_sip_core::Message;
use tokio::sync::{broadcast, Mutex, Semaphore};

use crate::error::{Result, TransportError};
use crate::hop::Hop;

use super::{Transport, TransportEvent};

/// §3 Channel state set, in the order transitions are expected to occur
/// (monotonic except RETRY→CONNECTING, enforced by [`Channel::transition`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Init = 0,
    ResInProgress = 1,
    ResDone = 2,
    Connecting = 3,
    Retry = 4,
    Ready = 5,
    Error = 6,
    Disconnected = 7,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelState::Init,
            1 => ChannelState::ResInProgress,
            2 => ChannelState::ResDone,
            3 => ChannelState::Connecting,
            4 => ChannelState::Retry,
            5 => ChannelState::Ready,
            6 => ChannelState::Error,
            _ => ChannelState::Disconnected,
        }
    }

    /// Ordering used to enforce the monotonic-transition invariant; RETRY is
    /// handled as a special case back to CONNECTING rather than through this
    /// ordering.
    fn rank(self) -> u8 {
        self as u8
    }
}

/// One ordered byte-stream (or, for UDP, a logical peer) plus its outgoing
/// queue, reassembly state, and listener fan-out.
pub struct Channel {
    peer: Hop,
    state: AtomicU8,
    local_addr: Mutex<Option<SocketAddr>>,
    public_addr: Mutex<Option<SocketAddr>>,
    /// The concrete peer address DNS resolution elected, i.e. where
    /// outgoing messages actually get written to. Distinct from
    /// `local_addr`, which is this end's own bound address.
    resolved_addr: Mutex<Option<SocketAddr>>,
    outgoing: Mutex<VecDeque<Message>>,
    send_gate: Semaphore,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    events: broadcast::Sender<TransportEvent>,
    last_recv: Mutex<Instant>,
    reliable: bool,
}

impl Channel {
    pub fn new(peer: Hop, reliable: bool) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(64);
        Arc::new(Channel {
            peer,
            state: AtomicU8::new(ChannelState::Init as u8),
            local_addr: Mutex::new(None),
            public_addr: Mutex::new(None),
            resolved_addr: Mutex::new(None),
            outgoing: Mutex::new(VecDeque::new()),
            send_gate: Semaphore::new(1),
            transport: Mutex::new(None),
            events,
            last_recv: Mutex::new(Instant::now()),
            reliable,
        })
    }

    pub fn peer(&self) -> &Hop {
        &self.peer
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Transitions to `new_state`, enforcing §3's invariant: "state
    /// transitions strictly monotonic except RETRY→CONNECTING". Notifies
    /// listeners with `StateChanged` either way; callers attempting an
    /// invalid transition get it silently clamped to a no-op, since a
    /// channel racing its own teardown should not panic the caller.
    pub fn transition(&self, new_state: ChannelState) {
        let current = self.state();
        let allowed = match (current, new_state) {
            (ChannelState::Retry, ChannelState::Connecting) => true,
            (ChannelState::Error, _) | (ChannelState::Disconnected, _) => false,
            (from, to) => to.rank() >= from.rank(),
        };
        if !allowed {
            return;
        }
        self.state.store(new_state as u8, Ordering::SeqCst);
        self.notify_state_changed(new_state);
    }

    fn notify_state_changed(&self, state: ChannelState) {
        let peer_addr = self
            .resolved_addr
            .try_lock()
            .ok()
            .and_then(|guard| *guard)
            .or_else(|| self.local_addr.try_lock().ok().and_then(|guard| *guard));
        if let Some(addr) = peer_addr {
            let _ = self.events.send(TransportEvent::StateChanged { peer: addr, state });
        }
    }

    pub async fn set_local_addr(&self, addr: SocketAddr) {
        *self.local_addr.lock().await = Some(addr);
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    pub async fn set_public_addr(&self, addr: SocketAddr) {
        *self.public_addr.lock().await = Some(addr);
    }

    pub async fn public_addr(&self) -> Option<SocketAddr> {
        *self.public_addr.lock().await
    }

    pub async fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.lock().await = Some(transport);
    }

    /// Records the concrete peer address DNS resolution + connect settled
    /// on, so the send pump knows where to write (§4.1 "current addrinfo
    /// iterator").
    pub async fn set_resolved_addr(&self, addr: SocketAddr) {
        *self.resolved_addr.lock().await = Some(addr);
    }

    pub async fn mark_recv(&self) {
        *self.last_recv.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> std::time::Duration {
        self.last_recv.lock().await.elapsed()
    }

    /// §4.1 `send(message)`: append to the outgoing queue and kick the send
    /// pump. Returns immediately; the wire write happens asynchronously
    /// once the channel reaches READY.
    pub async fn send(&self, message: Message) -> Result<()> {
        if matches!(self.state(), ChannelState::Error | ChannelState::Disconnected) {
            return Err(TransportError::NotReady(format!("channel to {} is closed", self.peer)).into());
        }
        self.outgoing.lock().await.push_back(message);
        self.drain_if_ready().await
    }

    /// Drains the queue in FIFO order while READY, holding the single-flight
    /// gate so at most one wire write is ever in progress (§3 "at most one
    /// outgoing send in flight").
    pub async fn drain_if_ready(&self) -> Result<()> {
        if self.state() != ChannelState::Ready {
            return Ok(());
        }
        let transport = self.transport.lock().await.clone();
        let Some(transport) = transport else {
            return Ok(());
        };
        let destination = match self.resolved_destination().await {
            Some(addr) => addr,
            None => return Ok(()),
        };

        let _permit = self.send_gate.acquire().await.map_err(|_| {
            TransportError::Closed
        })?;

        loop {
            let next = self.outgoing.lock().await.pop_front();
            let Some(message) = next else { break };
            transport.send_message(&message, destination).await?;
        }
        Ok(())
    }

    async fn resolved_destination(&self) -> Option<SocketAddr> {
        *self.resolved_addr.lock().await
    }

    /// §4.1 `notify_timeout()`: called by a transaction when an expected
    /// message never arrived. An idle/unresponsive channel transitions to
    /// ERROR; a channel that has seen recent traffic is left alone, since
    /// the timeout likely belongs to the transaction, not the channel.
    pub async fn notify_timeout(&self, unresponsive_after: std::time::Duration) {
        if self.idle_for().await >= unresponsive_after {
            self.transition(ChannelState::Error);
        }
    }

    /// §4.1 `close()`.
    pub async fn close(&self) {
        if let Some(transport) = self.transport.lock().await.as_ref() {
            let _ = transport.close().await;
        }
        let peer_addr = self.resolved_destination().await.or(self.local_addr().await);
        self.transition(ChannelState::Disconnected);
        if let Some(addr) = peer_addr {
            let _ = self.events.send(TransportEvent::Closed { peer: addr });
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), ChannelState::Error | ChannelState::Disconnected)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel({}, {:?})", self.peer, self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_to_connecting_is_allowed_out_of_order() {
        let chan = Channel::new(Hop::new(crate::hop::TransportKind::Tcp, "example.org", None), true);
        chan.transition(ChannelState::ResInProgress);
        chan.transition(ChannelState::ResDone);
        chan.transition(ChannelState::Connecting);
        chan.transition(ChannelState::Retry);
        assert_eq!(chan.state(), ChannelState::Retry);
        chan.transition(ChannelState::Connecting);
        assert_eq!(chan.state(), ChannelState::Connecting);
    }

    #[test]
    fn error_state_cannot_be_left() {
        let chan = Channel::new(Hop::new(crate::hop::TransportKind::Udp, "example.org", None), false);
        chan.transition(ChannelState::Error);
        chan.transition(ChannelState::Ready);
        assert_eq!(chan.state(), ChannelState::Error);
    }

    #[test]
    fn backward_transition_is_rejected() {
        let chan = Channel::new(Hop::new(crate::hop::TransportKind::Udp, "example.org", None), false);
        chan.transition(ChannelState::Ready);
        chan.transition(ChannelState::ResDone);
        assert_eq!(chan.state(), ChannelState::Ready);
    }
}
