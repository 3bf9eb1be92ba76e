//! Point-to-point frame delivery between nodes.
//!
//! A transport only moves opaque frames. Inbound frames are pushed into the
//! bounded queue whose receiving end the coordinator owns; encoding happens in
//! the coordinator through the injected [`crate::codec::Codec`].

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::error::TransportError;

pub mod memory;
pub mod udp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use udp::UdpTransport;

/// Receiving end of a node's inbound frame queue.
pub type InboundReceiver = mpsc::Receiver<Bytes>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Address the transport is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Largest frame `send` accepts, if bounded.
    fn max_frame_size(&self) -> Option<usize> {
        None
    }

    /// Fire-and-forget delivery. An `Ok` does not imply the frame arrived.
    async fn send(&self, to: SocketAddr, frame: Bytes) -> Result<(), TransportError>;
}
