//! TCP transport (§4.1 "TCP/TLS: stream reassembler").
//!
//! Generalizes the UDP transport's "socket + spawned receive loop +
//! broadcast events" shape to a byte stream: reads are pushed through a
//! [`super::stream::Reassembler`] before being parsed and surfaced as whole
//! messages.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rvoip_sip_core::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::error::{Result, TransportError};

use super::stream::Reassembler;
use super::{Transport, TransportEvent};

#[derive(Debug)]
pub struct TcpTransport {
    write_half: Mutex<OwnedWriteHalf>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    closed: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl TcpTransport {
    pub async fn connect(addr: SocketAddr) -> Result<(Arc<Self>, broadcast::Receiver<TransportEvent>)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        Self::from_stream(stream).await
    }

    pub async fn from_stream(
        stream: TcpStream,
    ) -> Result<(Arc<Self>, broadcast::Receiver<TransportEvent>)> {
        let local_addr = stream.local_addr().map_err(|e| TransportError::Io(e.to_string()))?;
        let peer_addr = stream.peer_addr().map_err(|e| TransportError::Io(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        let (events, rx) = broadcast::channel(256);

        let transport = Arc::new(TcpTransport {
            write_half: Mutex::new(write_half),
            local_addr,
            peer_addr,
            closed: AtomicBool::new(false),
            events,
        });

        transport.clone().spawn_receive_loop(read_half);
        Ok((transport, rx))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn spawn_receive_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
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
                                        warn!("malformed SIP frame from {}: {}", self.peer_addr, e);
                                        let _ = self.events.send(TransportEvent::Error {
                                            peer: Some(self.peer_addr),
                                            error: e.to_string(),
                                        });
                                    }
                                },
                                Ok(None) => break,
                                Err(e) => {
                                    // §4.1: missing Content-Length on a reliable transport; the
                                    // caller is responsible for answering 400 and not advancing.
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

#[async_trait]
impl Transport for TcpTransport {
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
