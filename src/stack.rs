//! The top-level object tying a configured stack together: DNS resolution,
//! listening points, the provider, and outbound channel connection (§4.1
//! "resolve/connect", §3 "Listening Point").
//!
//! Grounded in the teacher's `TransactionManager`/`DialogManager` top-level
//! split collapsed into one object, since this crate's spec calls for a
//! single stack-wide entry point rather than separate client/server
//! managers.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use rvoip_sip_core::Message;
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig as TlsClientConfig;
use tracing::warn;

use crate::config::StackConfig;
use crate::error::{Result, TransportError};
use crate::hop::{Hop, TransportKind};
use crate::provider::{Provider, ProviderEvent};
use crate::resolver::{combined, dual, mdns, CancelToken, Resolver, ResolverResults};
use crate::transport::channel::ChannelState;
use crate::transport::tcp::TcpTransport;
use crate::transport::tls::TlsTransport;
use crate::transport::udp::UdpTransport;
use crate::transport::{Channel, ListeningPoint, Transport, TransportEvent};

type ChannelKey = (TransportKind, String, u16);

pub struct SipStack {
    config: StackConfig,
    resolver: Resolver,
    provider: Arc<Provider>,
    udp_points: DashMap<SocketAddr, (Arc<ListeningPoint>, Arc<UdpTransport>)>,
    tcp_points: DashMap<SocketAddr, Arc<ListeningPoint>>,
    channels: DashMap<ChannelKey, Arc<Channel>>,
    tls_client_config: Mutex<Option<Arc<TlsClientConfig>>>,
}

impl SipStack {
    /// Builds a stack with no listening points yet; call
    /// [`Self::add_udp_listening_point`]/[`Self::add_tcp_listening_point`]
    /// to start accepting traffic.
    pub fn new(config: StackConfig) -> Result<(Arc<Self>, mpsc::Receiver<ProviderEvent>)> {
        let resolver = Resolver::from_config(&config)?;
        let (provider, events_rx) = Provider::new(config.clone());

        let stack = Arc::new(SipStack {
            config,
            resolver,
            provider,
            udp_points: DashMap::new(),
            tcp_points: DashMap::new(),
            channels: DashMap::new(),
            tls_client_config: Mutex::new(None),
        });

        Ok((stack, events_rx))
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Required before `channel_for` can hand out any TLS channel.
    pub async fn set_tls_client_config(&self, config: Arc<TlsClientConfig>) {
        *self.tls_client_config.lock().await = Some(config);
    }

    /// Binds a UDP listening point and starts feeding its inbound traffic
    /// into the provider's dispatch algorithm.
    pub async fn add_udp_listening_point(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let (point, transport) = ListeningPoint::bind_udp(addr).await?;
        let local_addr = point.local_addr();
        self.spawn_inbound_pump(point.clone());
        self.udp_points.insert(local_addr, (point, transport));
        Ok(local_addr)
    }

    /// Binds a TCP listening point; each accepted connection becomes its
    /// own channel, fed into the same dispatch pump.
    pub async fn add_tcp_listening_point(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let point = ListeningPoint::bind_tcp(addr).await?;
        let local_addr = point.local_addr();
        self.spawn_inbound_pump(point.clone());
        self.tcp_points.insert(local_addr, point);
        Ok(local_addr)
    }

    fn spawn_inbound_pump(self: &Arc<Self>, point: Arc<ListeningPoint>) {
        let stack = self.clone();
        let mut events = point.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let TransportEvent::MessageReceived { message, source, .. } = event {
                    stack.provider.handle_inbound(message, source).await;
                }
            }
        });
    }

    /// Returns an existing outbound channel for `hop`, or resolves and
    /// connects a new one (§4.1 "connect(): once resolved, attempt next
    /// addrinfo; on failure, retry the next until exhausted").
    pub async fn channel_for(self: &Arc<Self>, hop: &Hop) -> Result<Arc<Channel>> {
        let key = (hop.transport(), hop.host().to_string(), hop.port());
        if let Some(existing) = self.channels.get(&key) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }

        let addrs = self.resolve_hop(hop).await?;
        if addrs.is_empty() {
            return Err(TransportError::ResolutionFailed(hop.resolve_name().to_string()).into());
        }

        let channel = match hop.transport() {
            TransportKind::Udp => self.connect_udp(hop, &addrs).await?,
            TransportKind::Tcp => self.connect_tcp(hop, &addrs).await?,
            TransportKind::Tls => self.connect_tls(hop, &addrs).await?,
        };

        self.channels.insert(key, channel.clone());
        Ok(channel)
    }

    /// §4.3: SRV is skipped once the hop names an explicit port (a literal
    /// `host:port` target is never SRV-eligible).
    async fn resolve_hop(&self, hop: &Hop) -> Result<Vec<SocketAddr>> {
        let cancel = CancelToken::new();
        let name = hop.resolve_name();

        let results: ResolverResults = if mdns::is_mdns_name(name) {
            // §4.10: `.local` names are routed to the override table instead
            // of a real SRV/A query, mirroring belle-sip's `is_mdns_query`
            // dispatch — never falls through to unicast DNS even on a miss.
            mdns::resolve(self.resolver.mdns_overrides(), name)
        } else if hop.port_is_explicit() || !self.config.dns_srv_enabled {
            dual::resolve(&self.resolver, name, &cancel).await
        } else {
            combined::resolve(&self.resolver, name, &cancel).await
        };

        let fallback_port = if hop.port_is_explicit() {
            hop.port()
        } else {
            hop.transport().default_port()
        };

        Ok(candidate_addrs(&results, fallback_port))
    }

    async fn connect_udp(self: &Arc<Self>, hop: &Hop, addrs: &[SocketAddr]) -> Result<Arc<Channel>> {
        // UDP has no connect phase; reuse whichever listening point is
        // already bound, or open an ephemeral one.
        let (point, transport) = match self.udp_points.iter().next() {
            Some(entry) => entry.value().clone(),
            None => {
                let bind_addr: SocketAddr = "0.0.0.0:0".parse().expect("valid wildcard bind address");
                let (point, transport) = ListeningPoint::bind_udp(bind_addr).await?;
                self.spawn_inbound_pump(point.clone());
                self.udp_points.insert(point.local_addr(), (point.clone(), transport.clone()));
                (point, transport)
            }
        };

        let destination = addrs[0];
        let channel = Channel::new(hop.clone(), false);
        channel.set_transport(transport).await;
        channel.set_local_addr(point.local_addr()).await;
        channel.set_resolved_addr(destination).await;
        channel.transition(ChannelState::ResDone);
        channel.transition(ChannelState::Connecting);
        channel.transition(ChannelState::Ready);
        point.insert_channel(hop, channel.clone());
        Ok(channel)
    }

    async fn connect_tcp(self: &Arc<Self>, hop: &Hop, addrs: &[SocketAddr]) -> Result<Arc<Channel>> {
        let channel = Channel::new(hop.clone(), true);
        channel.transition(ChannelState::ResDone);
        channel.transition(ChannelState::Connecting);

        let mut last_err = None;
        for (idx, addr) in addrs.iter().enumerate() {
            match TcpTransport::connect(*addr).await {
                Ok((transport, rx)) => {
                    channel.set_transport(transport.clone()).await;
                    channel.set_local_addr(transport.local_addr()?).await;
                    channel.set_resolved_addr(*addr).await;
                    channel.transition(ChannelState::Ready);
                    self.spawn_channel_pump(channel.clone(), rx);
                    if idx > 0 {
                        let key = (hop.transport(), hop.host().to_string(), hop.port());
                        self.maybe_reconnect_primary(hop, key, addrs.to_vec());
                    }
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "TCP connect attempt failed, advancing to next addrinfo");
                    last_err = Some(e);
                }
            }
        }
        channel.transition(ChannelState::Error);
        Err(last_err.unwrap_or_else(|| TransportError::ConnectFailed(hop.resolve_name().to_string())))
    }

    async fn connect_tls(self: &Arc<Self>, hop: &Hop, addrs: &[SocketAddr]) -> Result<Arc<Channel>> {
        let tls_config = self
            .tls_client_config
            .lock()
            .await
            .clone()
            .ok_or_else(|| TransportError::TlsHandshakeFailed("no TLS client config configured".into()))?;
        let server_name = ServerName::try_from(hop.host().to_string())
            .map_err(|e| TransportError::TlsHandshakeFailed(e.to_string()))?;

        let channel = Channel::new(hop.clone(), true);
        channel.transition(ChannelState::ResDone);
        channel.transition(ChannelState::Connecting);

        let mut last_err = None;
        for (idx, addr) in addrs.iter().enumerate() {
            match TlsTransport::connect(*addr, server_name.clone(), tls_config.clone(), None).await {
                Ok((transport, rx)) => {
                    channel.set_transport(transport.clone()).await;
                    channel.set_local_addr(transport.local_addr()?).await;
                    channel.set_resolved_addr(*addr).await;
                    channel.transition(ChannelState::Ready);
                    self.spawn_channel_pump(channel.clone(), rx);
                    if idx > 0 {
                        let key = (hop.transport(), hop.host().to_string(), hop.port());
                        self.maybe_reconnect_primary(hop, key, addrs.to_vec());
                    }
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "TLS connect attempt failed, advancing to next addrinfo");
                    last_err = Some(e);
                }
            }
        }
        channel.transition(ChannelState::Error);
        Err(last_err.unwrap_or_else(|| TransportError::ConnectFailed(hop.resolve_name().to_string())))
    }

    /// §4.10 belle-sip `provider.c`: once a channel has failed over to a
    /// non-primary SRV target, retry the primary address in the background;
    /// if it becomes reachable, swap it into the channel registry so the
    /// next `channel_for` for this hop picks it up. The channel already in
    /// flight keeps using its current transport — only *new* lookups move.
    fn maybe_reconnect_primary(self: &Arc<Self>, hop: &Hop, key: ChannelKey, addrs: Vec<SocketAddr>) {
        if !self.config.reconnect_to_primary_asap {
            return;
        }
        let Some(&primary) = addrs.first() else {
            return;
        };

        let stack = self.clone();
        let hop = hop.clone();
        let retry_interval = self.config.reconnect_primary_retry_interval;
        tokio::spawn(async move {
            tokio::time::sleep(retry_interval).await;
            let reconnected = match hop.transport() {
                TransportKind::Tcp => stack.connect_tcp(&hop, &[primary]).await,
                TransportKind::Tls => stack.connect_tls(&hop, &[primary]).await,
                TransportKind::Udp => return,
            };
            match reconnected {
                Ok(channel) => {
                    stack.channels.insert(key, channel);
                    tracing::info!(hop = %hop.resolve_name(), addr = %primary, "reconnected to primary SRV target");
                }
                Err(e) => {
                    warn!(hop = %hop.resolve_name(), error = %e, "primary SRV target still unreachable");
                }
            }
        });
    }

    fn spawn_channel_pump(
        self: &Arc<Self>,
        channel: Arc<Channel>,
        mut events: tokio::sync::broadcast::Receiver<TransportEvent>,
    ) {
        let stack = self.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    TransportEvent::MessageReceived { message, source, .. } => {
                        channel.mark_recv().await;
                        stack.provider.handle_inbound(message, source).await;
                    }
                    TransportEvent::Closed { .. } => {
                        channel.transition(ChannelState::Disconnected);
                        break;
                    }
                    _ => {}
                }
            }
        });
    }

    /// Sends an out-of-transaction message directly on a resolved channel,
    /// bypassing the transaction layer (used for stray ACKs/CANCELs the
    /// caller builds by hand).
    pub async fn send_raw(self: &Arc<Self>, hop: &Hop, message: Message) -> Result<()> {
        let channel = self.channel_for(hop).await?;
        channel.send(message).await
    }
}

/// Flattens a [`ResolverResults`] into an ordered candidate list: SRV
/// targets (each carrying its own port) take priority over plain A/AAAA
/// records (which use `fallback_port`).
fn candidate_addrs(results: &ResolverResults, fallback_port: u16) -> Vec<SocketAddr> {
    if !results.srv_list.is_empty() {
        results
            .srv_list
            .iter()
            .flat_map(|entry| entry.a_results.iter().map(move |a| SocketAddr::new(a.addr, entry.port)))
            .collect()
    } else {
        results.addrinfo.iter().map(|a| SocketAddr::new(a.addr, fallback_port)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{AddrInfo, SrvEntry};

    #[test]
    fn candidate_addrs_prefers_srv_targets_over_addrinfo() {
        let mut results = ResolverResults::empty("example.org");
        results.addrinfo.push(AddrInfo { addr: "10.0.0.1".parse().unwrap(), port: 0, ttl: 300 });
        results.srv_list.push(SrvEntry {
            priority: 0,
            weight: 0,
            port: 5061,
            target: "sip1.example.org".to_string(),
            ttl: 300,
            a_results: vec![AddrInfo { addr: "10.0.0.2".parse().unwrap(), port: 0, ttl: 300 }],
        });

        let addrs = candidate_addrs(&results, 5060);
        assert_eq!(addrs, vec!["10.0.0.2:5061".parse().unwrap()]);
    }

    #[test]
    fn candidate_addrs_falls_back_to_addrinfo_with_default_port() {
        let mut results = ResolverResults::empty("example.org");
        results.addrinfo.push(AddrInfo { addr: "10.0.0.1".parse().unwrap(), port: 0, ttl: 300 });

        let addrs = candidate_addrs(&results, 5060);
        assert_eq!(addrs, vec!["10.0.0.1:5060".parse().unwrap()]);
    }
}
