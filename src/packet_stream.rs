use std::net::SocketAddr;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::error::EngineResult;

/// The capability of sending and receiving single datagrams to / from peer addresses, bounded
///  by an MTU. This is the seam between the packet engine and the underlying link: UDP is the
///  default implementation, other datagram-capable links (or test doubles) plug in here.
///
/// Every call transmits or receives exactly one datagram.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketStream: Send + Sync + 'static {
    /// The largest datagram (including the packet header) that can be sent or received
    fn mtu(&self) -> usize;

    fn local_addr(&self) -> SocketAddr;

    /// Send one datagram. The caller must never pass more than [PacketStream::mtu] bytes. A
    ///  datagram that is sent only partially is reported as a transport fault.
    async fn send_packet(&self, buf: &[u8], to: SocketAddr) -> EngineResult<usize>;

    /// Receive one datagram into `buf`, which must be at least [PacketStream::mtu] bytes long.
    ///  Returns [crate::error::EngineError::Timeout] if nothing arrives within the timeout.
    async fn recv_packet(&self, buf: &mut [u8], timeout: Option<Duration>) -> EngineResult<(usize, SocketAddr)>;

    /// resolves when a datagram can be received without waiting
    async fn readable(&self) -> EngineResult<()>;

    /// resolves when a datagram can be sent without waiting
    async fn writable(&self) -> EngineResult<()>;

    /// Stop the stream: pending and future receive calls fail with `PeerClosed`
    fn stop(&self);
}
