//! # Transport Layer
//!
//! Framed delivery of opaque byte payloads between nodes over an unreliable
//! substrate. The transport is not cryptographically trusted: every guarantee
//! above best-effort datagram delivery lives in the secure channel and the
//! per-message sequence numbers carried by higher layers.
//!
//! Two implementations ship with the core:
//!
//! - [`UdpTransport`] — the production substrate, one socket per node
//! - [`InMemoryTransport`] — a process-local hub for tests and simulations,
//!   with switches to take nodes down and observe backpressure
//!
//! Neither implementation orders frames across sources, and per-source FIFO
//! is best-effort only.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::wire::MAX_FRAME_LEN;
use crate::{MeshError, Result};

/// Transport endpoint address. Socket addresses for UDP, hub names in tests.
pub type Addr = String;

/// Framed byte delivery between nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame to `dest`. Fails with `Unreachable` when the
    /// destination cannot be addressed and `Backpressure` when its queue is
    /// full.
    async fn send(&self, dest: &Addr, bytes: &[u8]) -> Result<()>;

    /// Receive the next frame from any source. Pends forever on a quiet
    /// substrate; errors only when the transport itself is torn down.
    async fn recv(&self) -> Result<(Addr, Vec<u8>)>;

    /// The address peers should use to reach this endpoint.
    fn local_addr(&self) -> Addr;
}

/// UDP-backed transport. One datagram per logical frame; the 64 KiB frame
/// bound keeps every frame within a single datagram.
pub struct UdpTransport {
    socket: UdpSocket,
    local: Addr,
}

impl UdpTransport {
    pub async fn bind(listen: &str) -> Result<Self> {
        let socket = UdpSocket::bind(listen)
            .await
            .map_err(|e| MeshError::Transport(format!("bind {listen}: {e}")))?;
        let local = socket
            .local_addr()
            .map_err(|e| MeshError::Transport(e.to_string()))?
            .to_string();
        Ok(Self { socket, local })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, dest: &Addr, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(MeshError::Validation(format!(
                "frame of {} bytes exceeds the 64 KiB bound",
                bytes.len()
            )));
        }
        match self.socket.send_to(bytes, dest).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(MeshError::Backpressure(dest.clone()))
            }
            Err(e) => Err(MeshError::Unreachable(format!("{dest}: {e}"))),
        }
    }

    async fn recv(&self) -> Result<(Addr, Vec<u8>)> {
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let (len, src) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| MeshError::Transport(e.to_string()))?;
        buf.truncate(len);
        Ok((src.to_string(), buf))
    }

    fn local_addr(&self) -> Addr {
        self.local.clone()
    }
}

/// Shared routing table for [`InMemoryTransport`] endpoints.
///
/// The hub models an unreliable substrate: endpoints can be taken down
/// (frames to them fail with `Unreachable`) and directed links can be cut to
/// simulate partitions.
#[derive(Default)]
pub struct TransportHub {
    endpoints: DashMap<Addr, mpsc::Sender<(Addr, Vec<u8>)>>,
    down: DashSet<Addr>,
    cut_links: DashSet<(Addr, Addr)>,
}

impl TransportHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new endpoint with a bounded receive queue.
    pub fn attach(self: &Arc<Self>, addr: &str, queue: usize) -> InMemoryTransport {
        let (tx, rx) = mpsc::channel(queue);
        self.endpoints.insert(addr.to_string(), tx);
        InMemoryTransport {
            hub: Arc::clone(self),
            addr: addr.to_string(),
            rx: Mutex::new(rx),
        }
    }

    /// Take an endpoint down; subsequent sends to it fail `Unreachable`.
    pub fn take_down(&self, addr: &str) {
        self.down.insert(addr.to_string());
    }

    /// Bring a previously downed endpoint back.
    pub fn bring_up(&self, addr: &str) {
        self.down.remove(addr);
    }

    /// Cut the directed link `src → dst`.
    pub fn cut_link(&self, src: &str, dst: &str) {
        self.cut_links.insert((src.to_string(), dst.to_string()));
    }

    /// Restore the directed link `src → dst`.
    pub fn restore_link(&self, src: &str, dst: &str) {
        self.cut_links.remove(&(src.to_string(), dst.to_string()));
    }

    fn deliver(&self, src: &Addr, dest: &Addr, bytes: &[u8]) -> Result<()> {
        if self.down.contains(dest) || self.cut_links.contains(&(src.clone(), dest.clone())) {
            return Err(MeshError::Unreachable(dest.clone()));
        }
        let sender = self
            .endpoints
            .get(dest)
            .ok_or_else(|| MeshError::Unreachable(dest.clone()))?;
        sender
            .try_send((src.clone(), bytes.to_vec()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => MeshError::Backpressure(dest.clone()),
                mpsc::error::TrySendError::Closed(_) => MeshError::Unreachable(dest.clone()),
            })
    }
}

/// Process-local transport endpoint attached to a [`TransportHub`].
pub struct InMemoryTransport {
    hub: Arc<TransportHub>,
    addr: Addr,
    rx: Mutex<mpsc::Receiver<(Addr, Vec<u8>)>>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, dest: &Addr, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(MeshError::Validation(format!(
                "frame of {} bytes exceeds the 64 KiB bound",
                bytes.len()
            )));
        }
        self.hub.deliver(&self.addr, dest, bytes)
    }

    async fn recv(&self) -> Result<(Addr, Vec<u8>)> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| MeshError::Transport("transport closed".into()))
    }

    fn local_addr(&self) -> Addr {
        self.addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_delivers_between_endpoints() {
        let hub = TransportHub::new();
        let a = hub.attach("a", 8);
        let b = hub.attach("b", 8);

        a.send(&"b".to_string(), b"ping").await.unwrap();
        let (src, bytes) = b.recv().await.unwrap();
        assert_eq!(src, "a");
        assert_eq!(bytes, b"ping");
    }

    #[tokio::test]
    async fn unknown_and_downed_endpoints_are_unreachable() {
        let hub = TransportHub::new();
        let a = hub.attach("a", 8);
        let _b = hub.attach("b", 8);

        let err = a.send(&"nowhere".to_string(), b"x").await.unwrap_err();
        assert!(matches!(err, MeshError::Unreachable(_)));

        hub.take_down("b");
        let err = a.send(&"b".to_string(), b"x").await.unwrap_err();
        assert!(matches!(err, MeshError::Unreachable(_)));

        hub.bring_up("b");
        a.send(&"b".to_string(), b"x").await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_reports_backpressure() {
        let hub = TransportHub::new();
        let a = hub.attach("a", 1);
        let _b = hub.attach("b", 1);

        a.send(&"b".to_string(), b"1").await.unwrap();
        let err = a.send(&"b".to_string(), b"2").await.unwrap_err();
        assert!(matches!(err, MeshError::Backpressure(_)));
    }

    #[tokio::test]
    async fn cut_links_are_directional() {
        let hub = TransportHub::new();
        let a = hub.attach("a", 8);
        let b = hub.attach("b", 8);

        hub.cut_link("a", "b");
        assert!(a.send(&"b".to_string(), b"x").await.is_err());
        b.send(&"a".to_string(), b"y").await.unwrap();

        hub.restore_link("a", "b");
        a.send(&"b".to_string(), b"x").await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let hub = TransportHub::new();
        let a = hub.attach("a", 8);
        let _b = hub.attach("b", 8);
        let huge = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(a.send(&"b".to_string(), &huge).await.is_err());
    }

    #[tokio::test]
    async fn udp_transport_round_trips() {
        let a = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        a.send(&b.local_addr(), b"hello").await.unwrap();
        let (src, bytes) = b.recv().await.unwrap();
        assert_eq!(src, a.local_addr());
        assert_eq!(bytes, b"hello");
    }
}
