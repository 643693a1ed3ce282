//! UDP transport (§4.1 "UDP: one datagram = one message").
//!
//! Directly grounded in the teacher's `UdpTransport`: a socket wrapped in an
//! `Arc`, a spawned receive loop that parses every datagram with
//! `rvoip_sip_core::parse_message` and forwards `TransportEvent`s, and
//! `send_message` writing straight through. UDP has no connect phase, so a
//! `Channel` built over it goes straight from `ResDone` to `Ready`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rvoip_sip_core::Message;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};

use super::{Transport, TransportEvent};

#[derive(Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    closed: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<(Arc<Self>, broadcast::Receiver<TransportEvent>)> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let (events, rx) = broadcast::channel(256);

        let transport = Arc::new(UdpTransport {
            socket: Arc::new(socket),
            closed: AtomicBool::new(false),
            events,
        });

        transport.clone().spawn_receive_loop();
        Ok((transport, rx))
    }

    fn spawn_receive_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_535];
            let local = self.socket.local_addr().ok();
            while !self.closed.load(Ordering::Relaxed) {
                match self.socket.recv_from(&mut buf).await {
                    Ok((n, source)) => {
                        let packet = &buf[..n];
                        match rvoip_sip_core::parse_message(packet) {
                            Ok(message) => {
                                debug!("received {} bytes from {}", n, source);
                                let _ = self.events.send(TransportEvent::MessageReceived {
                                    message,
                                    source,
                                    local: local.unwrap_or(source),
                                });
                            }
                            Err(e) => {
                                warn!("malformed SIP datagram from {}: {}", source, e);
                                let _ = self.events.send(TransportEvent::Error {
                                    peer: Some(source),
                                    error: e.to_string(),
                                });
                            }
                        }
                    }
                    Err(e) => {
                        if self.closed.load(Ordering::Relaxed) {
                            break;
                        }
                        let _ = self.events.send(TransportEvent::Error { peer: None, error: e.to_string() });
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(|e| TransportError::Io(e.to_string()).into())
    }

    async fn send_message(&self, message: &Message, destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        let bytes = message.to_bytes();
        self.socket
            .send_to(&bytes, destination)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn is_reliable(&self) -> bool {
        false
    }
}
