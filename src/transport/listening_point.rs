//! `ListeningPoint` (§3): owns a local (ip, port, transport) and the set of
//! channels opened against it; removes a channel from the set once it
//! reaches ERROR (§3 "when channel enters ERROR state, removes it from the
//! set").

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::hop::{Hop, TransportKind};

use super::channel::{Channel, ChannelState};
use super::udp::UdpTransport;
use super::TransportEvent;

/// Keys a channel by the remote peer it talks to.
type ChannelKey = (TransportKind, String, u16);

pub struct ListeningPoint {
    local_addr: SocketAddr,
    transport_kind: TransportKind,
    channels: DashMap<ChannelKey, Arc<Channel>>,
    events: broadcast::Sender<TransportEvent>,
}

impl ListeningPoint {
    /// Binds a UDP listening point; the owned socket is shared by every
    /// logical peer channel, since UDP has no per-peer connection.
    pub async fn bind_udp(addr: SocketAddr) -> Result<(Arc<Self>, Arc<UdpTransport>)> {
        let (transport, mut rx) = UdpTransport::bind(addr).await?;
        let local_addr = transport.local_addr()?;
        let (events, _rx) = broadcast::channel(256);

        let point = Arc::new(ListeningPoint {
            local_addr,
            transport_kind: TransportKind::Udp,
            channels: DashMap::new(),
            events: events.clone(),
        });

        let point_clone = point.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let _ = point_clone.events.send(event);
            }
        });

        Ok((point, transport))
    }

    /// Binds a TCP listening point that accepts inbound connections, each
    /// becoming its own channel.
    pub async fn bind_tcp(addr: SocketAddr) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| crate::error::TransportError::Io(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| crate::error::TransportError::Io(e.to_string()))?;
        let (events, _rx) = broadcast::channel(256);

        let point = Arc::new(ListeningPoint {
            local_addr,
            transport_kind: TransportKind::Tcp,
            channels: DashMap::new(),
            events,
        });

        point.clone().spawn_accept_loop(listener);
        Ok(point)
    }

    fn spawn_accept_loop(self: Arc<Self>, listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        if let Ok((transport, mut rx)) = super::tcp::TcpTransport::from_stream(stream).await {
                            let hop = Hop::new(TransportKind::Tcp, peer_addr.ip().to_string(), Some(peer_addr.port()));
                            let channel = Channel::new(hop, true);
                            channel.set_transport(transport).await;
                            channel.transition(ChannelState::ResDone);
                            channel.transition(ChannelState::Connecting);
                            channel.transition(ChannelState::Ready);
                            channel.set_resolved_addr(peer_addr).await;
                            channel.set_local_addr(self.local_addr).await;
                            let key = (TransportKind::Tcp, peer_addr.ip().to_string(), peer_addr.port());
                            self.channels.insert(key.clone(), channel.clone());

                            let point = self.clone();
                            tokio::spawn(async move {
                                while let Ok(event) = rx.recv().await {
                                    if matches!(event, TransportEvent::Closed { .. }) {
                                        point.channels.remove(&key);
                                    }
                                    let _ = point.events.send(event);
                                }
                            });
                        }
                    }
                    Err(_) => break,
                }
            }
        });
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Returns an existing channel for `hop`, if the listening point already
    /// owns one.
    pub fn find_channel(&self, hop: &Hop) -> Option<Arc<Channel>> {
        let key = (hop.transport(), hop.host().to_string(), hop.port());
        self.channels.get(&key).map(|entry| entry.clone())
    }

    pub fn insert_channel(&self, hop: &Hop, channel: Arc<Channel>) {
        let key = (hop.transport(), hop.host().to_string(), hop.port());
        self.channels.insert(key, channel);
    }

    /// Sweeps channels that have reached ERROR, per the class invariant.
    pub fn reap_errored(&self) {
        self.channels.retain(|_, channel| channel.state() != ChannelState::Error);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reap_errored_removes_only_error_state_channels() {
        let point = ListeningPoint {
            local_addr: "127.0.0.1:5060".parse().unwrap(),
            transport_kind: TransportKind::Udp,
            channels: DashMap::new(),
            events: broadcast::channel(4).0,
        };
        let healthy = Channel::new(Hop::new(TransportKind::Udp, "a.example.org", None), false);
        let errored = Channel::new(Hop::new(TransportKind::Udp, "b.example.org", None), false);
        errored.transition(ChannelState::Error);

        point.insert_channel(healthy.peer(), healthy.clone());
        point.insert_channel(errored.peer(), errored.clone());
        assert_eq!(point.channel_count(), 2);
        point.reap_errored();
        assert_eq!(point.channel_count(), 1);
    }
}
