use std::time::Duration;
use anyhow::bail;

pub struct PacketEngineConfig {
    /// Number of packets (not bytes) per channel and direction that can be in flight at any
    ///  given time. Both peers agree on the smaller of their window sizes during the handshake.
    ///
    /// This must be a power of two so that sequence numbers map to ring slots contiguously
    ///  across the wrap-around at `u16::MAX`. A message must fit into the window, i.e. it can
    ///  have at most `window_size - 1` fragments.
    pub window_size: u16,

    /// Hysteresis for flow control: after a receiver asked its peer to pause, it resumes (sends
    ///  XON) only when the application consumed this many packets beyond the XOFF trigger point.
    pub xon_threshold: u16,

    /// Upper bound for the number of packets that exist at any given time, shared by all
    ///  channels of an engine. If this is exhausted, sends fail with `ResourceExhausted` and
    ///  received datagrams are dropped (and later retransmitted by the peer).
    pub packet_pool_size: usize,

    /// default bound for how long `push` waits for room in the send window; `None` waits
    ///  indefinitely (or until the channel closes)
    pub send_timeout: Option<Duration>,

    /// Unacknowledged packets are sent again after this duration. This is also the interval
    ///  for resending OPEN during a handshake, and for window probes while the peer asked us
    ///  to pause.
    ///
    /// Configure to roughly 2x RTT
    pub retransmit_timeout: Duration,

    /// The channel is aborted after this many consecutive retransmissions without progress
    pub max_retransmits: u32,

    /// how long `close()` waits for sent data to be acknowledged before sending CLOSE
    pub close_linger: Duration,
}

impl PacketEngineConfig {
    pub const MIN_WINDOW_SIZE: u16 = 4;
    pub const MAX_WINDOW_SIZE: u16 = 1 << 15;

    pub fn default_ipv4() -> PacketEngineConfig {
        PacketEngineConfig {
            window_size: 64,
            xon_threshold: 4,
            packet_pool_size: 4096,
            send_timeout: None,
            retransmit_timeout: Duration::from_millis(200),
            max_retransmits: 10,
            close_linger: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_size < Self::MIN_WINDOW_SIZE || self.window_size > Self::MAX_WINDOW_SIZE {
            bail!("window size must be between {} and {}, was {}", Self::MIN_WINDOW_SIZE, Self::MAX_WINDOW_SIZE, self.window_size);
        }
        if !self.window_size.is_power_of_two() {
            bail!("window size must be a power of two, was {}", self.window_size);
        }
        if self.window_size <= self.xon_threshold.saturating_add(2) {
            bail!("window size {} is too small for an XON threshold of {}", self.window_size, self.xon_threshold);
        }
        if self.packet_pool_size < self.window_size as usize {
            bail!("packet pool of {} packets can not hold a full window of {}", self.packet_pool_size, self.window_size);
        }
        if self.retransmit_timeout.is_zero() {
            bail!("retransmit timeout must not be zero");
        }
        if self.max_retransmits == 0 {
            bail!("max retransmits must be positive");
        }
        Ok(())
    }
}
