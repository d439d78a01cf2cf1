use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};
use crate::error::{EngineError, EngineResult};
use crate::packet_stream::PacketStream;

/// UDP payload that fits into a full Ethernet frame without IP options: `1500 - 20 - 8`
pub const DEFAULT_UDP_MTU: usize = 1472;

const IPV4_UDP_OVERHEAD: usize = 20 + 8;
const IPV6_UDP_OVERHEAD: usize = 40 + 8;

pub struct UdpPacketStreamConfig {
    /// The address to bind to; port 0 binds to an ephemeral port
    pub bind_addr: SocketAddr,

    /// Name of the network interface that `bind_addr` belongs to. If present (and the OS exposes
    ///  the interface's MTU), the MTU is derived from the interface.
    pub interface_name: Option<String>,

    /// Explicitly configured MTU (i.e. maximum UDP payload), taking precedence over the
    ///  interface's MTU.
    ///
    /// NB: Choosing this too big causes packets to be dropped on the way, which can be partial
    ///      if only some of the routes support smaller frames. There is no path MTU discovery.
    pub mtu: Option<usize>,
}

impl UdpPacketStreamConfig {
    pub fn new(ip: IpAddr, port: u16) -> UdpPacketStreamConfig {
        UdpPacketStreamConfig {
            bind_addr: SocketAddr::new(ip, port),
            interface_name: None,
            mtu: None,
        }
    }

    fn resolve_mtu(&self) -> usize {
        if let Some(mtu) = self.mtu {
            return mtu;
        }

        if let Some(name) = &self.interface_name {
            match interface_mtu(name) {
                Some(link_mtu) => {
                    let overhead = if self.bind_addr.is_ipv4() { IPV4_UDP_OVERHEAD } else { IPV6_UDP_OVERHEAD };
                    if link_mtu > overhead {
                        return link_mtu - overhead;
                    }
                    warn!("interface {} reports implausible MTU {} - using default", name, link_mtu);
                }
                None => {
                    debug!("MTU of interface {} is not available - using default", name);
                }
            }
        }
        DEFAULT_UDP_MTU
    }
}

#[cfg(target_os = "linux")]
fn interface_mtu(name: &str) -> Option<usize> {
    std::fs::read_to_string(format!("/sys/class/net/{}/mtu", name)).ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(not(target_os = "linux"))]
fn interface_mtu(_name: &str) -> Option<usize> {
    None
}


/// [PacketStream] over a bound UDP socket
pub struct UdpPacketStream {
    socket: UdpSocket,
    local_addr: SocketAddr,
    mtu: usize,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl UdpPacketStream {
    /// Bind the socket. If the configured port is 0, the actually bound port is available
    ///  through [PacketStream::local_addr].
    pub fn start(config: &UdpPacketStreamConfig) -> anyhow::Result<UdpPacketStream> {
        let socket = Socket::new(Domain::for_address(config.bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&config.bind_addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        let local_addr = socket.local_addr()?;
        let mtu = config.resolve_mtu();

        info!("UDP packet stream bound to {:?} with MTU {}", local_addr, mtu);
        Ok(UdpPacketStream {
            socket,
            local_addr,
            mtu,
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
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

        tokio::select! {
            result = self.socket.recv_from(buf) => {
                result.map_err(|e| {
                    error!("recvfrom failed: {}", e);
                    EngineError::from(e)
                })
            }
            _ = notified => Err(EngineError::PeerClosed),
        }
    }
}

#[async_trait]
impl PacketStream for UdpPacketStream {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_packet(&self, buf: &[u8], to: SocketAddr) -> EngineResult<usize> {
        debug_assert!(buf.len() <= self.mtu);
        self.check_stopped()?;

        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
        match self.socket.send_to(buf, to).await {
            Ok(sent) if sent == buf.len() => Ok(sent),
            Ok(sent) => {
                error!("short UDP send to {:?}: expected {}, actual {}", to, buf.len(), sent);
                Err(EngineError::TransportFault(format!("short write: {} of {} bytes", sent, buf.len())))
            }
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
                Err(e.into())
            }
        }
    }

    async fn recv_packet(&self, buf: &mut [u8], timeout: Option<Duration>) -> EngineResult<(usize, SocketAddr)> {
        debug_assert!(buf.len() >= self.mtu);

        match timeout {
            None => self.do_recv(buf).await,
            Some(timeout) => {
                tokio::time::timeout(timeout, self.do_recv(buf)).await
                    .map_err(|_| EngineError::Timeout)?
            }
        }
    }

    async fn readable(&self) -> EngineResult<()> {
        self.check_stopped()?;
        Ok(self.socket.readable().await?)
    }

    async fn writable(&self) -> EngineResult<()> {
        self.check_stopped()?;
        Ok(self.socket.writable().await?)
    }

    fn stop(&self) {
        debug!("stopping UDP packet stream on {:?}", self.local_addr);
        self.stopped.store(true, Ordering::Release);
        self.stop_notify.notify_waiters();
    }
}
