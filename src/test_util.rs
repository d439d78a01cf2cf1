use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::trace;
use crate::error::{EngineError, EngineResult};
use crate::packet_stream::PacketStream;

type DropPredicate = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// In-memory [PacketStream] connected to exactly one peer, for tests. Datagrams are delivered
///  in order unless the drop predicate discards them, which simulates packet loss. The fail
///  predicate makes sending fail instead, as a broken socket would.
pub struct LoopbackPacketStream {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    mtu: usize,
    to_peer: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    from_peer: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    drop_predicate: Mutex<Option<DropPredicate>>,
    fail_predicate: Mutex<Option<DropPredicate>>,
    num_sent: AtomicUsize,
    num_dropped: AtomicUsize,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl LoopbackPacketStream {
    pub fn pair(mtu: usize) -> (Arc<LoopbackPacketStream>, Arc<LoopbackPacketStream>) {
        let addr_a = SocketAddr::from(([127, 0, 0, 1], 10001));
        let addr_b = SocketAddr::from(([127, 0, 0, 1], 10002));
        let (send_a, recv_a) = mpsc::unbounded_channel();
        let (send_b, recv_b) = mpsc::unbounded_channel();

        (
            Arc::new(Self::new(addr_a, addr_b, mtu, send_b, recv_a)),
            Arc::new(Self::new(addr_b, addr_a, mtu, send_a, recv_b)),
        )
    }

    fn new(local_addr: SocketAddr, peer_addr: SocketAddr, mtu: usize, to_peer: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>, from_peer: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>) -> LoopbackPacketStream {
        LoopbackPacketStream {
            local_addr,
            peer_addr,
            mtu,
            to_peer,
            from_peer: tokio::sync::Mutex::new(from_peer),
            drop_predicate: Mutex::new(None),
            fail_predicate: Mutex::new(None),
            num_sent: AtomicUsize::new(0),
            num_dropped: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Outgoing datagrams for which the predicate returns true are silently discarded
    pub fn set_drop_predicate(&self, predicate: impl FnMut(&[u8]) -> bool + Send + 'static) {
        *self.drop_predicate.lock().unwrap() = Some(Box::new(predicate));
    }

    pub fn clear_drop_predicate(&self) {
        *self.drop_predicate.lock().unwrap() = None;
    }

    /// Sending datagrams for which the predicate returns true fails with a transport fault
    pub fn set_fail_predicate(&self, predicate: impl FnMut(&[u8]) -> bool + Send + 'static) {
        *self.fail_predicate.lock().unwrap() = Some(Box::new(predicate));
    }

    pub fn num_sent(&self) -> usize {
        self.num_sent.load(Ordering::Acquire)
    }

    pub fn num_dropped(&self) -> usize {
        self.num_dropped.load(Ordering::Acquire)
    }

    fn check_stopped(&self) -> EngineResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            Err(EngineError::PeerClosed)
        }
        else {
            Ok(())
        }
    }

    async fn do_recv(&self, buf: &mut [u8]) -> EngineResult<(usize, SocketAddr)> {
        let notified = self.stop_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        self.check_stopped()?;

        let mut from_peer = self.from_peer.lock().await;
        tokio::select! {
            received = from_peer.recv() => {
                match received {
                    Some((data, from)) => {
                        buf[..data.len()].copy_from_slice(&data);
                        Ok((data.len(), from))
                    }
                    None => Err(EngineError::PeerClosed),
                }
            }
            _ = notified => Err(EngineError::PeerClosed),
        }
    }
}

#[async_trait]
impl PacketStream for LoopbackPacketStream {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_packet(&self, buf: &[u8], to: SocketAddr) -> EngineResult<usize> {
        assert!(buf.len() <= self.mtu, "datagram of {} bytes exceeds MTU {}", buf.len(), self.mtu);
        self.check_stopped()?;
        if let Some(predicate) = self.fail_predicate.lock().unwrap().as_mut() {
            if predicate(buf) {
                trace!("loopback: failing to send {} bytes to {:?}", buf.len(), to);
                return Err(EngineError::TransportFault("injected send failure".to_string()));
            }
        }
        self.num_sent.fetch_add(1, Ordering::AcqRel);

        let dropped = to != self.peer_addr || match self.drop_predicate.lock().unwrap().as_mut() {
            Some(predicate) => predicate(buf),
            None => false,
        };
        if dropped {
            trace!("loopback: dropping {} bytes to {:?}", buf.len(), to);
            self.num_dropped.fetch_add(1, Ordering::AcqRel);
        }
        else {
            // the peer may be gone, which is no different from a lost datagram
            let _ = self.to_peer.send((buf.to_vec(), self.local_addr));
        }
        Ok(buf.len())
    }

    async fn recv_packet(&self, buf: &mut [u8], timeout: Option<Duration>) -> EngineResult<(usize, SocketAddr)> {
        match timeout {
            None => self.do_recv(buf).await,
            Some(timeout) => tokio::time::timeout(timeout, self.do_recv(buf)).await
                .map_err(|_| EngineError::Timeout)?,
        }
    }

    async fn readable(&self) -> EngineResult<()> {
        self.check_stopped()
    }

    async fn writable(&self) -> EngineResult<()> {
        self.check_stopped()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop_notify.notify_waiters();
    }
}
