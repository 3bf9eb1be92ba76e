//! In-process transport for simulations and tests.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

use super::{InboundReceiver, Transport};
use crate::error::TransportError;

#[derive(Debug)]
struct NetworkInner {
    routes: HashMap<SocketAddr, mpsc::Sender<Bytes>>,
    isolated: HashSet<SocketAddr>,
    loss_rate: f64,
    rng: StdRng,
    delivered: u64,
    dropped: u64,
}

/// A switchboard routing frames between registered addresses.
///
/// Frames to or from an isolated address, and a random `loss_rate` share of
/// the rest, vanish silently the way datagrams do.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_loss(0.0, 0)
    }

    /// Network dropping `loss_rate` of frames, reproducible through `seed`.
    pub fn with_loss(loss_rate: f64, seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                routes: HashMap::new(),
                isolated: HashSet::new(),
                loss_rate: loss_rate.clamp(0.0, 1.0),
                rng: StdRng::seed_from_u64(seed),
                delivered: 0,
                dropped: 0,
            })),
        }
    }

    /// Attach a node at `addr` with an inbound queue of `capacity` frames.
    pub fn register(&self, addr: SocketAddr, capacity: usize) -> (MemoryTransport, InboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.inner.lock().routes.insert(addr, tx);
        (
            MemoryTransport {
                addr,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Detach `addr`; later sends to it fail as unreachable.
    pub fn unregister(&self, addr: &SocketAddr) {
        self.inner.lock().routes.remove(addr);
    }

    /// Cut `addr` off in both directions.
    pub fn isolate(&self, addr: SocketAddr) {
        self.inner.lock().isolated.insert(addr);
    }

    pub fn heal(&self, addr: &SocketAddr) {
        self.inner.lock().isolated.remove(addr);
    }

    pub fn set_loss_rate(&self, loss_rate: f64) {
        self.inner.lock().loss_rate = loss_rate.clamp(0.0, 1.0);
    }

    /// `(delivered, dropped)` frame counts so far.
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.delivered, inner.dropped)
    }

    fn route(&self, from: SocketAddr, to: SocketAddr, frame: Bytes) -> Result<(), TransportError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let lost = inner.isolated.contains(&from)
            || inner.isolated.contains(&to)
            || (inner.loss_rate > 0.0 && inner.rng.random_bool(inner.loss_rate));
        if lost {
            inner.dropped += 1;
            trace!(%from, %to, "Frame dropped by simulated network");
            return Ok(());
        }

        let Some(sender) = inner.routes.get(&to) else {
            return Err(TransportError::Unreachable(to));
        };
        match sender.try_send(frame) {
            Ok(()) => {
                inner.delivered += 1;
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                inner.dropped += 1;
                Err(TransportError::QueueFull(to))
            }
            Err(TrySendError::Closed(_)) => {
                inner.routes.remove(&to);
                Err(TransportError::Unreachable(to))
            }
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's handle on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, to: SocketAddr, frame: Bytes) -> Result<(), TransportError> {
        self.network.route(self.addr, to, frame)
    }
}
