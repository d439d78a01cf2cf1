use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::buffers::packet_pool::PacketPool;
use crate::buffers::window_ring::WindowRing;
use crate::error::{EngineError, EngineResult};
use crate::packet::{Packet, PacketFlags, PacketHeader, PacketKind};
use crate::seq_num::SeqNum;

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ChannelState {
    Opening,
    Open,
    Closed,
    Aborted,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Aborted)
    }
}


struct TxSlot {
    packet: Packet,
    last_sent: Option<Instant>,
    drop_payload: bool,
}

/// What the send task should do for a channel's transmit window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPlan {
    Idle,
    /// re-send `resend` packets starting at `tx_drain`, then send `fresh` packets starting at
    ///  the first unsent sequence number
    Send { resend: u16, fresh: u16 },
    /// the peer did not acknowledge anything for too long
    GiveUp,
}

/// Transmit side of a channel's sliding window.
///
/// Sequence numbers in `[drain, next_to_send)` were sent at least once and wait for an ACK,
///  `[next_to_send, fill)` were pushed by the application but not sent yet.
pub struct TxWindow {
    window_size: u16,
    fill: SeqNum,
    drain: SeqNum,
    next_to_send: SeqNum,
    /// the peer asked us to pause
    flow_off: bool,
    /// when we last heard 'flow off', or sent a window probe
    flow_off_since: Option<Instant>,
    num_retransmits: u32,
    /// payload-dropping is decided at a message's first fragment and inherited by the rest
    dropping_message: bool,
    ring: WindowRing<TxSlot>,
}

impl TxWindow {
    pub fn new(capacity: u16) -> TxWindow {
        TxWindow {
            window_size: capacity,
            fill: SeqNum::ZERO,
            drain: SeqNum::ZERO,
            next_to_send: SeqNum::ZERO,
            flow_off: false,
            flow_off_since: None,
            num_retransmits: 0,
            dropping_message: false,
            ring: WindowRing::new(capacity),
        }
    }

    pub fn window_size(&self) -> u16 {
        self.window_size
    }

    fn set_window_size(&mut self, window_size: u16) {
        assert!(window_size <= self.ring.capacity());
        self.window_size = window_size;
    }

    pub fn fill(&self) -> SeqNum {
        self.fill
    }

    pub fn drain(&self) -> SeqNum {
        self.drain
    }

    pub fn is_flow_off(&self) -> bool {
        self.flow_off
    }

    pub fn in_flight(&self) -> u16 {
        self.fill - self.drain
    }

    pub fn is_empty(&self) -> bool {
        self.fill == self.drain
    }

    /// number of packets that can be added without violating `fill - drain < window_size`
    pub fn room(&self) -> u16 {
        self.window_size - self.in_flight() - 1
    }

    /// Place a message's fragments into the window. The caller checked that there is room
    ///  and passes exactly one packet per fragment.
    pub fn enqueue(&mut self, channel_id: u32, buf: &[u8], max_payload: usize, expire_at: Option<Instant>, packets: Vec<Packet>) {
        debug_assert!(packets.len() <= self.room() as usize);
        debug_assert_eq!(packets.len(), buf.len().div_ceil(max_payload));

        let num_fragments = packets.len();
        for (i, (chunk, mut packet)) in buf.chunks(max_payload).zip(packets).enumerate() {
            let mut flags = PacketFlags::empty();
            if i == 0 {
                flags |= PacketFlags::BOM;
            }
            if i == num_fragments - 1 {
                flags |= PacketFlags::EOM;
            }

            packet.init(PacketHeader::new(channel_id, self.fill, PacketKind::Data, flags), expire_at, chunk);
            trace!("enqueueing {:?}", packet);

            let prev = self.ring.insert(self.fill, TxSlot { packet, last_sent: None, drop_payload: false });
            debug_assert!(prev.is_none());
            self.fill = self.fill.next();
        }
    }

    /// Process a cumulative acknowledgement: everything before `ack_seq` was received. Returns
    ///  the number of packets that were released, i.e. the room that became available.
    pub fn on_ack(&mut self, ack_seq: SeqNum, flow_off: bool, now: Instant, pool: &PacketPool) -> u16 {
        let acked = ack_seq - self.drain;
        if acked > self.in_flight() {
            trace!("ignoring stale ACK {} - window is [{}, {})", ack_seq, self.drain, self.fill);
            return 0;
        }

        for _ in 0..acked {
            if let Some(slot) = self.ring.take(self.drain) {
                pool.return_packet(slot.packet);
            }
            self.drain = self.drain.next();
        }
        if self.next_to_send - self.drain > self.in_flight() {
            self.next_to_send = self.drain;
        }

        // any ACK proves the peer is alive
        self.num_retransmits = 0;

        if flow_off && !self.flow_off {
            debug!("peer requested flow off at {}", ack_seq);
            self.flow_off_since = Some(now);
        }
        self.flow_off = flow_off;
        if !flow_off {
            self.flow_off_since = None;
        }
        acked
    }

    pub fn on_xon(&mut self) {
        self.flow_off = false;
        self.flow_off_since = None;
        self.num_retransmits = 0;
    }

    /// Decide what to send now. Unsent packets go out unless the peer asked to pause. The
    ///  oldest unacknowledged packet being older than `retransmit_timeout` triggers re-sending
    ///  all unacknowledged packets; while paused, a single packet is sent per timeout as a window
    ///  probe. Each of these counts as a retransmission.
    pub fn plan(&mut self, now: Instant, retransmit_timeout: Duration, max_retransmits: u32) -> TxPlan {
        let unacked = self.next_to_send - self.drain;
        let unsent = self.fill - self.next_to_send;

        if self.flow_off {
            let probe_due = self.flow_off_since.map_or(true, |t| t + retransmit_timeout <= now);
            if !probe_due || (unacked == 0 && unsent == 0) {
                return TxPlan::Idle;
            }
            if self.num_retransmits >= max_retransmits {
                return TxPlan::GiveUp;
            }
            self.num_retransmits += 1;
            self.flow_off_since = Some(now);

            return if unacked > 0 {
                TxPlan::Send { resend: 1, fresh: 0 }
            }
            else {
                TxPlan::Send { resend: 0, fresh: 1 }
            };
        }

        let mut resend = 0;
        if unacked > 0 && self.is_due(self.drain, now, retransmit_timeout) {
            if self.num_retransmits >= max_retransmits {
                return TxPlan::GiveUp;
            }
            self.num_retransmits += 1;
            resend = unacked;
        }

        if resend == 0 && unsent == 0 {
            TxPlan::Idle
        }
        else {
            TxPlan::Send { resend, fresh: unsent }
        }
    }

    fn is_due(&self, seq: SeqNum, now: Instant, retransmit_timeout: Duration) -> bool {
        match self.ring.get(seq).and_then(|s| s.last_sent) {
            Some(last_sent) => last_sent + retransmit_timeout <= now,
            None => true,
        }
    }

    /// the point in time when [TxWindow::plan] will have something to do without further input
    pub fn next_deadline(&self, retransmit_timeout: Duration) -> Option<Instant> {
        if self.flow_off {
            if self.is_empty() {
                return None;
            }
            return self.flow_off_since.map(|t| t + retransmit_timeout);
        }
        if self.next_to_send != self.drain {
            return self.ring.get(self.drain)
                .and_then(|s| s.last_sent)
                .map(|t| t + retransmit_timeout);
        }
        None
    }

    /// Render the packet at `seq` for sending and mark it as sent. This is the unsent packet
    ///  if `fresh`, otherwise an unacknowledged one.
    pub fn encode_for_send(&mut self, seq: SeqNum, fresh: bool, now: Instant) -> Option<&[u8]> {
        if fresh {
            if seq != self.next_to_send || self.next_to_send == self.fill {
                return None;
            }
            self.next_to_send = self.next_to_send.next();

            let dropping_message = self.dropping_message;
            let slot = self.ring.get_mut(seq)?;
            slot.drop_payload = if slot.packet.is_bom() {
                slot.packet.is_expired(now)
            }
            else {
                dropping_message
            };
            self.dropping_message = slot.drop_payload;
            if slot.drop_payload {
                debug!("packet {} expired before it was sent - dropping its payload", seq);
            }
        }
        else if !seq.in_window(self.drain, self.next_to_send - self.drain) {
            return None;
        }

        let slot = self.ring.get_mut(seq)?;
        slot.last_sent = Some(now);
        Some(slot.packet.encode_for_send(now, slot.drop_payload))
    }

    /// sequence number of the next packet to go out for the first time
    pub fn next_to_send(&self) -> SeqNum {
        self.next_to_send
    }

    pub fn release_all(&mut self, pool: &PacketPool) {
        self.ring.drain_all(|slot| pool.return_packet(slot.packet));
        self.drain = self.fill;
        self.next_to_send = self.fill;
    }
}


/// Result of handing a received data packet to the receive window
pub struct RxArrival {
    pub stored: bool,
    /// cumulative ACK to send back
    pub ack_seq: SeqNum,
    pub flow_off: bool,
    /// the packet if it was not stored, so the caller can reuse it
    pub rejected: Option<Packet>,
}

/// Receive side of a channel's sliding window.
///
/// `[drain, fill)` is contiguously present and ready for the application; packets may also be
///  buffered beyond `fill` if they arrived out of order.
pub struct RxWindow {
    window_size: u16,
    xon_threshold: u16,
    fill: SeqNum,
    drain: SeqNum,
    ack: SeqNum,
    payload_offset: usize,
    is_mid_message: bool,
    in_expired_msg: bool,
    flow_off: bool,
    flow_seq: SeqNum,
    ring: WindowRing<Packet>,
}

impl RxWindow {
    pub fn new(capacity: u16, xon_threshold: u16) -> RxWindow {
        RxWindow {
            window_size: capacity,
            xon_threshold,
            fill: SeqNum::ZERO,
            drain: SeqNum::ZERO,
            ack: SeqNum::ZERO,
            payload_offset: 0,
            is_mid_message: false,
            in_expired_msg: false,
            flow_off: false,
            flow_seq: SeqNum::ZERO,
            ring: WindowRing::new(capacity),
        }
    }

    /// Shrink the window to the size agreed with the peer. The XON threshold was validated
    ///  against the local window only, so it is clamped to keep `window_size - 2 - xon_threshold`
    ///  positive.
    fn set_window_size(&mut self, window_size: u16) {
        assert!(window_size <= self.ring.capacity());
        assert!(window_size >= 4);
        self.window_size = window_size;
        if self.xon_threshold > window_size - 3 {
            debug!("reducing XON threshold from {} to {} for window size {}", self.xon_threshold, window_size - 3, window_size);
            self.xon_threshold = window_size - 3;
        }
    }

    pub fn window_size(&self) -> u16 {
        self.window_size
    }

    pub fn xon_threshold(&self) -> u16 {
        self.xon_threshold
    }

    pub fn fill(&self) -> SeqNum {
        self.fill
    }

    pub fn drain(&self) -> SeqNum {
        self.drain
    }

    pub fn ack(&self) -> SeqNum {
        self.ack
    }

    pub fn is_mid_message(&self) -> bool {
        self.is_mid_message
    }

    pub fn is_flow_off(&self) -> bool {
        self.flow_off
    }

    pub fn has_data(&self) -> bool {
        self.fill != self.drain
    }

    pub fn on_data(&mut self, packet: Packet) -> RxArrival {
        let seq = packet.seq();
        let position = seq - self.drain;

        let mut rejected = None;
        let stored = if position < self.window_size - 1 && !self.ring.is_occupied(seq) {
            if position >= self.window_size - 2 && !self.flow_off {
                debug!("receive window nearly full at {} - flow off", seq);
                self.flow_off = true;
                self.flow_seq = seq;
            }
            self.ring.insert(seq, packet);
            while self.fill - self.drain < self.window_size - 1 && self.ring.is_occupied(self.fill) {
                self.fill = self.fill.next();
            }
            true
        }
        else {
            trace!("not storing packet {}: duplicate or outside of window [{}, +{})", seq, self.drain, self.window_size - 1);
            rejected = Some(packet);
            false
        };

        self.ack = self.fill;
        RxArrival {
            stored,
            ack_seq: self.fill,
            flow_off: self.flow_off,
            rejected,
        }
    }

    /// Release expired messages at the start of the window. Expiry is decided at a message's
    ///  first fragment; the remaining fragments of an expired message are released as they
    ///  become available. Returns an error if the fragments do not form valid messages.
    pub fn skip_expired(&mut self, now: Instant, pool: &PacketPool) -> EngineResult<usize> {
        let mut num_released = 0;

        while self.has_data() {
            let Some(packet) = self.ring.get(self.drain) else {
                break;
            };

            if !self.in_expired_msg {
                if self.is_mid_message {
                    break;
                }
                if !packet.is_bom() {
                    warn!("fragment {} at the start of a message is not flagged BOM", self.drain);
                    return Err(EngineError::PeerClosed);
                }
                if !packet.is_expired(now) {
                    break;
                }
                debug!("message starting at {} expired - skipping", self.drain);
                self.in_expired_msg = true;
            }
            else if packet.is_bom() {
                warn!("fragment {} inside an expired message is flagged BOM", self.drain);
                return Err(EngineError::PeerClosed);
            }

            if let Some(packet) = self.ring.take(self.drain) {
                if packet.is_eom() {
                    self.in_expired_msg = false;
                }
                pool.return_packet(packet);
            }
            self.drain = self.drain.next();
            num_released += 1;
        }
        Ok(num_released)
    }

    /// Copy payload into `buf` until it is full or the end of a message is reached. Fully
    ///  consumed packets are returned to the pool.
    pub fn copy_out(&mut self, buf: &mut [u8], pool: &PacketPool) -> EngineResult<usize> {
        let mut copied = 0;

        while copied < buf.len() && self.has_data() {
            let Some(packet) = self.ring.get(self.drain) else {
                break;
            };

            if self.payload_offset == 0 {
                if !self.is_mid_message && !packet.is_bom() {
                    warn!("fragment {} at the start of a message is not flagged BOM", self.drain);
                    return Err(EngineError::PeerClosed);
                }
                if self.is_mid_message && packet.is_bom() {
                    warn!("fragment {} in the middle of a message is flagged BOM", self.drain);
                    return Err(EngineError::PeerClosed);
                }
            }

            let available = &packet.payload()[self.payload_offset..];
            let n = available.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&available[..n]);
            copied += n;
            self.payload_offset += n;
            self.is_mid_message = true;

            if self.payload_offset == packet.payload().len() {
                let is_eom = packet.is_eom();
                if let Some(packet) = self.ring.take(self.drain) {
                    pool.return_packet(packet);
                }
                self.drain = self.drain.next();
                self.payload_offset = 0;

                if is_eom {
                    self.is_mid_message = false;
                    break;
                }
            }
        }
        Ok(copied)
    }

    /// Clear 'flow off' if the application consumed enough. Returns true if an XON should be
    ///  sent to the peer.
    pub fn check_xon(&mut self) -> bool {
        if !self.flow_off {
            return false;
        }

        let pending = if self.flow_seq.in_window(self.drain, self.window_size) {
            self.flow_seq - self.drain
        }
        else {
            0
        };

        if self.drain == self.ack || pending < self.window_size - 2 - self.xon_threshold {
            debug!("receive window drained to {} - flow on", self.drain);
            self.flow_off = false;
            true
        }
        else {
            false
        }
    }

    pub fn release_all(&mut self, pool: &PacketPool) {
        self.ring.drain_all(|packet| pool.return_packet(packet));
        self.drain = self.fill;
        self.payload_offset = 0;
        self.is_mid_message = false;
        self.in_expired_msg = false;
    }
}


/// All state of a single channel, shared between the engine's background tasks and the
///  channel's [crate::engine_stream::PacketEngineStream]s.
///
/// Transmit and receive side have separate locks, each with its own wait signal.
pub struct ChannelInfo {
    id: u32,
    peer_addr: SocketAddr,
    state: AtomicU8,
    max_payload: AtomicUsize,
    pub(crate) tx: Mutex<TxWindow>,
    pub(crate) rx: Mutex<RxWindow>,
    /// notified when room becomes available in the transmit window, or on state changes
    pub(crate) tx_room: Notify,
    /// notified when data becomes available in the receive window, or on state changes
    pub(crate) rx_data: Notify,
    /// notified when the channel leaves `Opening`
    pub(crate) opened: Notify,
    /// the most recent failure sending this channel's data, cleared by a successful send
    send_error: std::sync::Mutex<Option<EngineError>>,
}

impl Debug for ChannelInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CHANNEL{{#{}@{:?}:{:?}}}", self.id, self.peer_addr, self.state())
    }
}

impl ChannelInfo {
    pub fn new(id: u32, peer_addr: SocketAddr, state: ChannelState, window_capacity: u16, xon_threshold: u16, max_payload: usize) -> ChannelInfo {
        ChannelInfo {
            id,
            peer_addr,
            state: AtomicU8::new(state.into()),
            max_payload: AtomicUsize::new(max_payload),
            tx: Mutex::new(TxWindow::new(window_capacity)),
            rx: Mutex::new(RxWindow::new(window_capacity, xon_threshold)),
            tx_room: Notify::new(),
            rx_data: Notify::new(),
            opened: Notify::new(),
            send_error: std::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(ChannelState::Aborted)
    }

    /// Fails unless the channel is open. A channel that was aborted while sending its data
    ///  failed reports that failure, any other channel that is not open `PeerClosed`.
    pub fn check_open(&self) -> EngineResult<()> {
        match self.state() {
            ChannelState::Open => Ok(()),
            ChannelState::Aborted => match self.send_error.lock().unwrap().as_ref() {
                Some(e) => Err(e.clone()),
                None => Err(EngineError::PeerClosed),
            },
            _ => Err(EngineError::PeerClosed),
        }
    }

    pub fn record_send_result(&self, result: &EngineResult<usize>) {
        let mut send_error = self.send_error.lock().unwrap();
        match result {
            Ok(_) => *send_error = None,
            Err(e) => {
                if send_error.is_none() {
                    debug!("channel {}: sending failed: {}", self.id, e);
                }
                *send_error = Some(e.clone());
            }
        }
    }

    /// Hand a send failure to the application, which decides whether to close the channel
    pub fn take_send_error(&self) -> Option<EngineError> {
        self.send_error.lock().unwrap().take()
    }

    pub fn has_send_error(&self) -> bool {
        self.send_error.lock().unwrap().is_some()
    }

    /// Move to a new state, returning the previous state. Returns `None` if the transition is
    ///  not allowed: nothing leaves `Closed` or `Aborted`, and nothing goes back to `Opening`.
    pub fn transition(&self, to: ChannelState) -> Option<ChannelState> {
        let result = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            let from = ChannelState::try_from(raw).ok()?;
            let allowed = match (from, to) {
                (ChannelState::Opening, ChannelState::Open) => true,
                (ChannelState::Opening | ChannelState::Open, ChannelState::Closed | ChannelState::Aborted) => true,
                _ => false,
            };
            allowed.then_some(to.into())
        });

        match result {
            Ok(raw) => {
                let from = ChannelState::try_from(raw).ok();
                debug!("channel {}: {:?} -> {:?}", self.id, from, to);
                self.tx_room.notify_waiters();
                self.rx_data.notify_waiters();
                self.opened.notify_waiters();
                from
            }
            Err(_) => None,
        }
    }

    /// Complete the handshake with the agreed parameters
    pub async fn establish(&self, window_size: u16, max_payload: usize) -> bool {
        self.tx.lock().await.set_window_size(window_size);
        self.rx.lock().await.set_window_size(window_size);
        self.max_payload.store(max_payload, Ordering::Release);
        self.transition(ChannelState::Open).is_some()
    }

    /// Return all buffered packets to the pool. Called after the channel reached a terminal
    ///  state.
    pub async fn release_buffers(&self, pool: &PacketPool) {
        self.tx.lock().await.release_all(pool);
        self.rx.lock().await.release_all(pool);
    }
}
