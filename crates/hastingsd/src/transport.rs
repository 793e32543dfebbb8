//! UDP transport for the discovery walk.
//!
//! Requests go out as one JSON `Envelope` per datagram through
//! `UdpMessaging`. A datagram the socket can't take right now is queued for
//! the `Outbound` task instead of failing the request. The receive loop
//! answers other nodes' pings and neighbours requests itself and forwards
//! responses to the walk.
//!
//! A sender is identified by the fingerprint it claims and the address the
//! datagram actually came from, never by the address it claims.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use hastings_core::wire::{Envelope, Payload};
use hastings_core::{CorrelationId, PeerHandle};
use hastings_services::{
    InboundResponse, MessagingError, PeerMessaging, PeerRecordStore, ResponseKind,
};

/// Datagrams waiting for the socket to become writable.
pub type Backlog = mpsc::Sender<(Vec<u8>, SocketAddr)>;

/// Sends discovery requests from the node's socket.
pub struct UdpMessaging {
    socket: Arc<UdpSocket>,
    own: PeerHandle,
    backlog: Backlog,
}

impl UdpMessaging {
    pub fn new(socket: Arc<UdpSocket>, own: PeerHandle, backlog: Backlog) -> Self {
        Self {
            socket,
            own,
            backlog,
        }
    }

    fn send(&self, peer: &PeerHandle, payload: Payload) -> Result<CorrelationId, MessagingError> {
        let correlation_id = CorrelationId::generate();
        let bytes = Envelope {
            correlation_id,
            sender: self.own.clone(),
            payload,
        }
        .encode()
        .map_err(|e| MessagingError::Encode(e.to_string()))?;

        // Never blocks the walk
        match self.socket.try_send_to(&bytes, peer.addr()) {
            Ok(_) => Ok(correlation_id),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                match self.backlog.try_send((bytes, peer.addr())) {
                    Ok(()) => Ok(correlation_id),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!(peer = %peer.addr(), "send backlog full");
                        Err(MessagingError::Unreachable(peer.clone()))
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(MessagingError::Closed),
                }
            }
            Err(e) => {
                tracing::debug!(peer = %peer.addr(), error = %e, "send failed");
                Err(MessagingError::Unreachable(peer.clone()))
            }
        }
    }
}

impl PeerMessaging for UdpMessaging {
    fn send_neighbours_request(&self, peer: &PeerHandle) -> Result<CorrelationId, MessagingError> {
        self.send(peer, Payload::PeerNeighboursRequest)
    }

    fn send_ping(&self, peer: &PeerHandle) -> Result<CorrelationId, MessagingError> {
        self.send(peer, Payload::PingRequest)
    }
}

/// Drains the send backlog, waiting for the socket each time.
pub struct Outbound {
    pub socket: Arc<UdpSocket>,
    pub backlog: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    pub shutdown: broadcast::Receiver<()>,
}

impl Outbound {
    pub async fn run(mut self) -> Result<()> {
        loop {
            let (bytes, to) = tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),
                next = self.backlog.recv() => match next {
                    Some(d) => d,
                    None => return Ok(()),
                },
            };
            if let Err(e) = self.socket.send_to(&bytes, to).await {
                // The request's TTL accounts for it
                tracing::debug!(to = %to, error = %e, "queued send failed");
            }
        }
    }
}

/// Everything the receive loop needs.
pub struct Receiver {
    pub socket: Arc<UdpSocket>,
    pub own: PeerHandle,
    pub store: Arc<dyn PeerRecordStore>,
    pub neighbour_count: usize,
    pub max_datagram: usize,
    pub responses: mpsc::Sender<InboundResponse>,
    pub shutdown: broadcast::Receiver<()>,
}

impl Receiver {
    /// Receive datagrams until shutdown.
    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; self.max_datagram];
        tracing::info!(addr = %self.own.addr(), "discovery receiver starting");

        loop {
            let (len, src) = tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("discovery receiver shutting down");
                    return Ok(());
                }
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        continue;
                    }
                },
            };

            let envelope = match Envelope::decode(&buf[..len]) {
                Ok(e) => e,
                Err(e) => {
                    tracing::trace!(src = %src, error = %e, "dropping malformed datagram");
                    continue;
                }
            };

            if envelope.sender.fingerprint() == self.own.fingerprint() {
                tracing::trace!("ignoring own datagram");
                continue;
            }

            self.handle(envelope, src).await;
        }
    }

    async fn handle(&self, envelope: Envelope, src: SocketAddr) {
        let Envelope {
            correlation_id,
            sender,
            payload,
        } = envelope;
        let sender = PeerHandle::from_parts(src, *sender.fingerprint());

        let kind = match payload {
            Payload::PingRequest => {
                self.reply(correlation_id, Payload::PingResponse, src).await;
                return;
            }
            Payload::PeerNeighboursRequest => {
                let peers = self.store.best(self.neighbour_count, &sender);
                tracing::debug!(
                    peer = sender.short(),
                    count = peers.len(),
                    "answering neighbours request"
                );
                self.reply(correlation_id, Payload::PeerNeighboursResponse { peers }, src)
                    .await;
                return;
            }
            Payload::PingResponse => ResponseKind::Pong,
            Payload::PeerNeighboursResponse { peers } => ResponseKind::Neighbours(peers),
        };

        let response = InboundResponse {
            correlation_id,
            sender,
            kind,
        };
        if self.responses.send(response).await.is_err() {
            tracing::debug!("discovery walk gone, response dropped");
        }
    }

    async fn reply(&self, correlation_id: CorrelationId, payload: Payload, to: SocketAddr) {
        let envelope = Envelope {
            correlation_id,
            sender: self.own.clone(),
            payload,
        };
        let bytes = match envelope.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode reply");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, to).await {
            tracing::debug!(to = %to, error = %e, "reply not sent");
        }
    }
}
