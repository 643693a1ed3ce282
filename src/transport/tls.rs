//! TLS channel variant (§4.2).
//!
//! Certificate parsing/validation and key material are external
//! collaborators per scope (§1); this module only drives the handshake
//! through `tokio_rustls`, given an already-built `rustls::ClientConfig`
//! (chain-of-trust policy, client cert, verifier exceptions all live in that
//! config, assembled by the application). What belongs here is the SIP-level
//! behavior layered on top: optional HTTP CONNECT tunneling before the
//! handshake starts, and framing identical to plain TCP once it finishes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rvoip_sip_core::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::warn;

use crate::error::{Result, TransportError};

use super::stream::Reassembler;
use super::{Transport, TransportEvent};

/// Optional HTTP CONNECT proxy parameters (§4.10 supplement, belle-sip's
/// `tunnel_client`).
#[derive(Debug, Clone)]
pub struct ProxyTunnel {
    pub proxy_addr: SocketAddr,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug)]
pub struct TlsTransport {
    write_half: Mutex<WriteHalf<TlsStream<TcpStream>>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    closed: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl TlsTransport {
    pub async fn connect(
        addr: SocketAddr,
        server_name: ServerName<'static>,
        config: Arc<tokio_rustls::rustls::ClientConfig>,
        tunnel: Option<ProxyTunnel>,
    ) -> Result<(Arc<Self>, broadcast::Receiver<TransportEvent>)> {
        let dial_addr = tunnel.as_ref().map(|t| t.proxy_addr).unwrap_or(addr);
        let mut tcp = TcpStream::connect(dial_addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        if let Some(tunnel) = &tunnel {
            establish_connect_tunnel(&mut tcp, addr, tunnel).await?;
        }

        let local_addr = tcp.local_addr().map_err(|e| TransportError::Io(e.to_string()))?;
        let peer_addr = addr;

        let connector = TlsConnector::from(config);
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::TlsHandshakeFailed(e.to_string()))?;

        let (read_half, write_half) = tokio::io::split(tls_stream);
        let (events, rx) = broadcast::channel(256);

        let transport = Arc::new(TlsTransport {
            write_half: Mutex::new(write_half),
            local_addr,
            peer_addr,
            closed: AtomicBool::new(false),
            events,
        });

        transport.clone().spawn_receive_loop(read_half);
        Ok((transport, rx))
    }

    fn spawn_receive_loop(self: Arc<Self>, mut read_half: ReadHalf<TlsStream<TcpStream>>) {
        tokio::spawn(async move {
            let mut reassembler = Reassembler::new();
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                if self.closed.load(Ordering::Relaxed) {
                    break;
                }
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        self.closed.store(true, Ordering::Relaxed);
                        let _ = self.events.send(TransportEvent::Closed { peer: self.peer_addr });
                        break;
                    }
                    Ok(n) => {
                        reassembler.push(&buf[..n]);
                        loop {
                            match reassembler.try_extract() {
                                Ok(Some(frame)) => match rvoip_sip_core::parse_message(&frame) {
                                    Ok(message) => {
                                        let _ = self.events.send(TransportEvent::MessageReceived {
                                            message,
                                            source: self.peer_addr,
                                            local: self.local_addr,
                                        });
                                    }
                                    Err(e) => {
                                        warn!("malformed SIP frame over TLS from {}: {}", self.peer_addr, e);
                                    }
                                },
                                Ok(None) => break,
                                Err(e) => {
                                    let _ = self.events.send(TransportEvent::Error {
                                        peer: Some(self.peer_addr),
                                        error: e.to_string(),
                                    });
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = self.events.send(TransportEvent::Error {
                            peer: Some(self.peer_addr),
                            error: e.to_string(),
                        });
                        break;
                    }
                }
            }
        });
    }
}

/// §4.2 "Optional HTTP CONNECT tunneling": sends a CONNECT request with
/// optional Basic-auth `Proxy-Authorization`, waits for `200`, before the
/// TLS handshake begins.
async fn establish_connect_tunnel(
    tcp: &mut TcpStream,
    target: SocketAddr,
    tunnel: &ProxyTunnel,
) -> Result<()> {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let (Some(user), Some(pass)) = (&tunnel.username, &tunnel.password) {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");

    tcp.write_all(request.as_bytes())
        .await
        .map_err(|e| TransportError::ProxyTunnelFailed(e.to_string()))?;

    let mut buf = [0u8; 1024];
    let n = tcp
        .read(&mut buf)
        .await
        .map_err(|e| TransportError::ProxyTunnelFailed(e.to_string()))?;
    let response = String::from_utf8_lossy(&buf[..n]);
    let status_line = response.lines().next().unwrap_or_default();
    if !status_line.contains(" 200 ") {
        return Err(TransportError::ProxyTunnelFailed(format!(
            "proxy CONNECT rejected: {status_line}"
        ))
        .into());
    }
    Ok(())
}

#[async_trait]
impl Transport for TlsTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn send_message(&self, message: &Message, _destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        let bytes = message.to_bytes();
        let mut write_half = self.write_half.lock().await;
        write_half
            .write_all(&bytes)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        let mut write_half = self.write_half.lock().await;
        let _ = write_half.shutdown().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn is_reliable(&self) -> bool {
        true
    }
}
