//! Datagram transport over a tokio UDP socket.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, error::TrySendError},
    task::AbortHandle,
};
use tracing::{debug, error, info};

use super::{InboundReceiver, Transport};
use crate::error::TransportError;

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// One socket per node; a background task moves received datagrams into the
/// inbound queue. The task stops when the transport or the queue is dropped.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    recv_task: AbortHandle,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr, capacity: usize) -> io::Result<(Self, InboundReceiver)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let recv_task = tokio::spawn(receive_loop(socket.clone(), tx)).abort_handle();
        info!(%local_addr, "UDP transport bound");

        Ok((
            Self {
                socket,
                local_addr,
                recv_task,
            },
            rx,
        ))
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, inbound: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; 65_536];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to receive UDP datagram: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        match inbound.try_send(Bytes::copy_from_slice(&buf[..len])) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(%from, "Inbound queue full, dropping datagram");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Inbound queue closed, stopping UDP receive loop");
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn max_frame_size(&self) -> Option<usize> {
        Some(MAX_DATAGRAM_SIZE)
    }

    async fn send(&self, to: SocketAddr, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                limit: MAX_DATAGRAM_SIZE,
            });
        }
        self.socket.send_to(&frame, to).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn test_datagrams_reach_inbound_queue() {
        let (a, _a_rx) = UdpTransport::bind(loopback(), 8).await.unwrap();
        let (b, mut b_rx) = UdpTransport::bind(loopback(), 8).await.unwrap();

        a.send(b.local_addr(), Bytes::from_static(b"ping"))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_refused() {
        let (a, _rx) = UdpTransport::bind(loopback(), 8).await.unwrap();
        let frame = Bytes::from(vec![0u8; MAX_DATAGRAM_SIZE + 1]);
        let err = a.send(a.local_addr(), frame).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }
}
