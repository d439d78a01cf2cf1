use std::cmp::min;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::buffers::packet_pool::PacketPool;
use crate::channel::{ChannelInfo, ChannelState, TxPlan};
use crate::config::PacketEngineConfig;
use crate::engine_stream::PacketEngineStream;
use crate::error::{EngineError, EngineResult};
use crate::listener::{PacketEngineListener, ProtectedListener};
use crate::packet::{OpenParams, Packet, PacketFlags, PacketHeader, PacketKind};
use crate::safe_converter::{PrecheckedCast, SaturatingCast};
use crate::seq_num::SeqNum;
use crate::session_registry::{PeerEndpoint, SessionRegistry};
use crate::packet_stream::PacketStream;

/// The packet engine is where everything comes together: it owns a [PacketStream] and the
///  table of channels multiplexed over it, and runs one background task for sending and one
///  for receiving.
///
/// Application code opens channels with [PacketEngine::connect] or accepts them through a
///  [PacketEngineListener], and then talks to peers through [PacketEngineStream]s.
pub struct PacketEngine {
    config: Arc<PacketEngineConfig>,
    stream: Arc<dyn PacketStream>,
    pool: Arc<PacketPool>,
    channels: Mutex<FxHashMap<u32, Arc<ChannelInfo>>>,
    /// wakes the send task when there may be something new to send
    tx_alert: Notify,
    listener: ProtectedListener,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PacketEngine {
    pub fn new(stream: Arc<dyn PacketStream>, config: PacketEngineConfig) -> anyhow::Result<Arc<PacketEngine>> {
        config.validate()?;

        let mtu = stream.mtu();
        if mtu <= PacketHeader::SERIALIZED_LEN + OpenParams::SERIALIZED_LEN {
            bail!("MTU of {} bytes is too small", mtu);
        }
        if mtu > u16::MAX as usize {
            bail!("MTU of {} bytes exceeds the maximum of {}", mtu, u16::MAX);
        }

        let pool = Arc::new(PacketPool::new(mtu, config.packet_pool_size));
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(PacketEngine {
            config: Arc::new(config),
            stream,
            pool,
            channels: Default::default(),
            tx_alert: Notify::new(),
            listener: Default::default(),
            shutdown,
            tasks: Default::default(),
        }))
    }

    /// Spawn the engine's send and receive tasks
    pub fn start(self: &Arc<Self>) {
        info!("starting packet engine on {:?}", self.stream.local_addr());

        let send_engine = self.clone();
        let recv_engine = self.clone();
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(async move { send_engine.send_loop().await }));
        tasks.push(tokio::spawn(async move { recv_engine.recv_loop().await }));
    }

    /// Close all channels, stop the packet stream and wait for the background tasks to finish
    pub async fn stop(&self) {
        if self.shutdown.send_replace(true) {
            debug!("packet engine was stopped before");
            return;
        }
        info!("stopping packet engine on {:?}", self.stream.local_addr());

        for channel in self.snapshot_channels() {
            self.send_close(&channel).await;
            self.finish_channel(&channel, ChannelState::Closed).await;
        }
        self.stream.stop();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            if let Err(e) = task.await {
                error!("packet engine task terminated abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow()
    }

    fn check_running(&self) -> EngineResult<()> {
        if self.is_running() {
            Ok(())
        }
        else {
            Err(EngineError::PeerClosed)
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.stream.local_addr()
    }

    pub fn mtu(&self) -> usize {
        self.stream.mtu()
    }

    pub fn config(&self) -> &PacketEngineConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub fn num_channels(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// Look up a channel, pinning it for the caller. The table lock is held only for the
    ///  lookup.
    pub(crate) fn acquire_channel(&self, channel_id: u32) -> Option<Arc<ChannelInfo>> {
        self.channels.lock().unwrap().get(&channel_id).cloned()
    }

    fn snapshot_channels(&self) -> Vec<Arc<ChannelInfo>> {
        self.channels.lock().unwrap().values().cloned().collect()
    }

    fn remove_channel(&self, channel: &Arc<ChannelInfo>) {
        let mut channels = self.channels.lock().unwrap();
        if channels.get(&channel.id()).is_some_and(|c| Arc::ptr_eq(c, channel)) {
            channels.remove(&channel.id());
        }
    }

    pub async fn set_listener(&self, listener: Option<Arc<dyn PacketEngineListener>>) {
        self.listener.set(listener).await;
    }

    pub(crate) fn alert_send_task(&self) {
        self.tx_alert.notify_one();
    }

    /// Open a channel to a peer, waiting up to `timeout` for the peer to accept it
    pub async fn connect(self: &Arc<Self>, endpoint: PeerEndpoint, timeout: Duration) -> EngineResult<PacketEngineStream> {
        self.check_running()?;

        let local_mtu = endpoint.mtu.map_or(self.mtu(), |mtu| mtu.min(self.mtu()));
        if local_mtu <= PacketHeader::SERIALIZED_LEN + OpenParams::SERIALIZED_LEN {
            return Err(EngineError::TransportFault(format!("MTU of {} bytes for {:?} is too small", local_mtu, endpoint.addr)));
        }

        let channel = {
            let mut channels = self.channels.lock().unwrap();
            let channel_id = loop {
                let candidate = rand::random::<u32>();
                if !channels.contains_key(&candidate) {
                    break candidate;
                }
            };
            let channel = Arc::new(ChannelInfo::new(
                channel_id,
                endpoint.addr,
                ChannelState::Opening,
                self.config.window_size,
                self.config.xon_threshold,
                local_mtu - PacketHeader::SERIALIZED_LEN,
            ));
            channels.insert(channel_id, channel.clone());
            channel
        };
        debug!("opening channel {} to {:?}", channel.id(), endpoint.addr);

        let open_params = OpenParams {
            window_size: self.config.window_size,
            mtu: local_mtu.prechecked_cast(),
        };
        let deadline = Instant::now() + timeout;
        loop {
            let opened = channel.opened.notified();
            tokio::pin!(opened);
            opened.as_mut().enable();

            match channel.state() {
                ChannelState::Open => {
                    info!("channel {} to {:?} is open", channel.id(), endpoint.addr);
                    return Ok(PacketEngineStream::new(self.clone(), &channel));
                }
                ChannelState::Opening => {}
                state => {
                    debug!("channel {} to {:?} was rejected: {:?}", channel.id(), endpoint.addr, state);
                    self.remove_channel(&channel);
                    return Err(EngineError::PeerClosed);
                }
            }

            let header = PacketHeader::new(channel.id(), SeqNum::ZERO, PacketKind::Open, PacketFlags::empty());
            self.send_control(header, Some(open_params), endpoint.addr).await;

            let wait_until = min(deadline, Instant::now() + self.config.retransmit_timeout);
            if tokio::time::timeout_at(wait_until, opened).await.is_err() && Instant::now() >= deadline {
                warn!("timeout opening channel {} to {:?}", channel.id(), endpoint.addr);
                self.finish_channel(&channel, ChannelState::Aborted).await;
                return Err(EngineError::Timeout);
            }
        }
    }

    /// Open a channel to the endpoint registered for a session
    pub async fn connect_session(self: &Arc<Self>, registry: &SessionRegistry, session_id: u32, timeout: Duration) -> EngineResult<PacketEngineStream> {
        let endpoint = registry.endpoint(session_id)
            .ok_or(EngineError::PeerClosed)?;
        self.connect(endpoint, timeout).await
    }

    /// Close a channel gracefully: wait up to the configured linger time for sent data to be
    ///  acknowledged, then tell the peer.
    pub async fn disconnect(&self, channel_id: u32) {
        let Some(channel) = self.acquire_channel(channel_id) else {
            debug!("disconnect: channel {} does not exist (any more)", channel_id);
            return;
        };

        let deadline = Instant::now() + self.config.close_linger;
        while channel.state() == ChannelState::Open {
            let room = channel.tx_room.notified();
            tokio::pin!(room);
            room.as_mut().enable();

            if channel.tx.lock().await.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, room).await.is_err() {
                debug!("channel {}: unacknowledged data left after linger time", channel_id);
                break;
            }
        }

        self.send_close(&channel).await;
        self.finish_channel(&channel, ChannelState::Closed).await;
    }

    /// Abort a channel after a protocol violation or when the peer stopped responding
    pub(crate) async fn abort_channel(&self, channel: &Arc<ChannelInfo>) {
        warn!("aborting channel {} to {:?}", channel.id(), channel.peer_addr());
        self.send_close(channel).await;
        self.finish_channel(channel, ChannelState::Aborted).await;
    }

    /// Move a channel to a terminal state, waking everybody waiting on it, remove it from the
    ///  table and reclaim its packets. Only the first call for a channel has an effect.
    async fn finish_channel(&self, channel: &Arc<ChannelInfo>, state: ChannelState) {
        let Some(prev_state) = channel.transition(state) else {
            return;
        };
        self.remove_channel(channel);
        channel.release_buffers(&self.pool).await;

        if prev_state == ChannelState::Open {
            self.listener.on_channel_closed(channel.id()).await;
        }
    }

    async fn send_close(&self, channel: &ChannelInfo) {
        let header = PacketHeader::new(channel.id(), SeqNum::ZERO, PacketKind::Close, PacketFlags::empty());
        self.send_control(header, None, channel.peer_addr()).await;
    }

    pub(crate) async fn send_xon(&self, channel: &ChannelInfo, rx_fill: SeqNum) {
        let header = PacketHeader::new(channel.id(), rx_fill, PacketKind::Xon, PacketFlags::empty());
        self.send_control(header, None, channel.peer_addr()).await;
    }

    /// Send a header-only packet (plus handshake parameters for OPEN and OPEN_ACK). Failures
    ///  are logged by the packet stream and otherwise ignored, since the protocol recovers from
    ///  lost control packets.
    async fn send_control(&self, header: PacketHeader, open_params: Option<OpenParams>, to: SocketAddr) {
        let mut buf = [0u8; PacketHeader::SERIALIZED_LEN + OpenParams::SERIALIZED_LEN];
        let len = {
            let mut w: &mut [u8] = &mut buf;
            header.ser(&mut w);
            if let Some(params) = open_params {
                params.ser(&mut w);
            }
            PacketHeader::SERIALIZED_LEN + OpenParams::SERIALIZED_LEN - w.len()
        };

        trace!("sending {:?} to {:?}", header, to);
        if let Err(e) = self.stream.send_packet(&buf[..len], to).await {
            debug!("error sending {:?} packet to {:?}: {}", header.kind, to, e);
        }
    }

    /// Agree on window size and max payload from the local and the peer's parameters. The
    ///  window is rounded down to a power of two.
    fn agree_on_params(&self, local_max_payload: usize, peer: OpenParams) -> Option<(u16, usize)> {
        let window_size = self.config.window_size.min(peer.window_size);
        if window_size < PacketEngineConfig::MIN_WINDOW_SIZE {
            return None;
        }
        let window_size = 1u16 << (15 - window_size.leading_zeros());

        let peer_max_payload = (peer.mtu as usize).checked_sub(PacketHeader::SERIALIZED_LEN)
            .filter(|&n| n > 0)?;
        Some((window_size, local_max_payload.min(peer_max_payload)))
    }

    async fn send_loop(self: Arc<Self>) {
        info!("starting send loop");
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let alert = self.tx_alert.notified();
            tokio::pin!(alert);
            alert.as_mut().enable();

            let next_deadline = self.send_due_packets().await;
            let sleep = async move {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = alert => {}
                _ = sleep => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("send loop terminated");
    }

    /// Send whatever is due on all open channels. Returns when the next retransmission
    ///  becomes due, if any.
    async fn send_due_packets(&self) -> Option<Instant> {
        let retransmit_timeout = self.config.retransmit_timeout;
        let mut next_deadline: Option<Instant> = None;

        for channel in self.snapshot_channels() {
            if channel.state() != ChannelState::Open {
                continue;
            }

            let mut tx = channel.tx.lock().await;
            let now = Instant::now();
            match tx.plan(now, retransmit_timeout, self.config.max_retransmits) {
                TxPlan::Idle => {}
                TxPlan::GiveUp => {
                    drop(tx);
                    if channel.has_send_error() {
                        warn!("channel {}: sending to {:?} keeps failing", channel.id(), channel.peer_addr());
                    }
                    else {
                        warn!("channel {}: no response from {:?} after {} retransmissions", channel.id(), channel.peer_addr(), self.config.max_retransmits);
                    }
                    self.abort_channel(&channel).await;
                    continue;
                }
                TxPlan::Send { resend, fresh } => {
                    let drain = tx.drain();
                    if resend > 0 {
                        debug!("channel {}: retransmitting {} packets from {}", channel.id(), resend, drain);
                    }
                    for i in 0..resend {
                        if let Some(wire) = tx.encode_for_send(drain + i, false, now) {
                            let result = self.stream.send_packet(wire, channel.peer_addr()).await;
                            channel.record_send_result(&result);
                        }
                    }
                    for _ in 0..fresh {
                        let seq = tx.next_to_send();
                        if let Some(wire) = tx.encode_for_send(seq, true, now) {
                            trace!("channel {}: sending packet {}", channel.id(), seq);
                            let result = self.stream.send_packet(wire, channel.peer_addr()).await;
                            channel.record_send_result(&result);
                        }
                    }
                }
            }

            if let Some(deadline) = tx.next_deadline(retransmit_timeout) {
                next_deadline = Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
            }
        }
        next_deadline
    }

    async fn recv_loop(self: Arc<Self>) {
        info!("starting receive loop");
        let mut shutdown = self.shutdown.subscribe();

        // for draining the socket while the pool is exhausted
        let mut scratch = vec![0u8; self.mtu()];
        let mut spare: Option<Packet> = None;

        loop {
            let mut packet = match spare.take() {
                Some(packet) => packet,
                None => match self.pool.get_packet() {
                    Ok(packet) => packet,
                    Err(_) => {
                        let received = tokio::select! {
                            r = self.stream.recv_packet(&mut scratch, None) => r,
                            _ = shutdown.changed() => break,
                        };
                        match received {
                            Ok((len, from)) => {
                                let correlation_id = Uuid::new_v4();
                                let span = span!(Level::TRACE, "packet_received", ?correlation_id);
                                self.on_datagram_without_packet(&scratch[..len], from)
                                    .instrument(span)
                                    .await;
                            }
                            Err(EngineError::PeerClosed) => break,
                            Err(e) => error!("receive error: {}", e),
                        }
                        continue;
                    }
                }
            };

            let received = tokio::select! {
                r = self.stream.recv_packet(packet.recv_buf(), None) => r,
                _ = shutdown.changed() => break,
            };
            let (len, from) = match received {
                Ok(x) => x,
                Err(EngineError::PeerClosed) => break,
                Err(e) => {
                    error!("receive error: {}", e);
                    spare = Some(packet);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            spare = self.on_datagram(packet, len, from)
                .instrument(span)
                .await;
        }
        info!("receive loop terminated");
    }

    /// Dispatch a received datagram. Returns the packet if it was not stored, so the receive
    ///  loop can reuse it.
    async fn on_datagram(self: &Arc<Self>, mut packet: Packet, len: usize, from: SocketAddr) -> Option<Packet> {
        if let Err(e) = packet.decode_received(len, Instant::now()) {
            debug!("received unparsable datagram from {:?} - dropping: {}", from, e);
            return Some(packet);
        }
        trace!("received {:?} from {:?}", packet, from);

        if packet.kind() == PacketKind::Data {
            let Some(channel) = self.channel_for(packet.header(), from).await else {
                return Some(packet);
            };
            return self.on_data(&channel, packet).await;
        }

        self.on_control(packet.header(), packet.payload(), from).await;
        Some(packet)
    }

    /// Dispatch a datagram that was received while the packet pool was exhausted. Control
    ///  packets need no pool packet and are handled as usual, since ACKs are what releases
    ///  packets from transmit windows. Data is dropped, and the sender will retransmit it.
    async fn on_datagram_without_packet(self: &Arc<Self>, datagram: &[u8], from: SocketAddr) {
        let header = match PacketHeader::deser(&mut &datagram[..]) {
            Ok(header) => header,
            Err(e) => {
                debug!("received unparsable datagram from {:?} - dropping: {}", from, e);
                return;
            }
        };
        trace!("received {:?} from {:?} while the packet pool is exhausted", header, from);

        if header.kind == PacketKind::Data {
            debug!("packet pool exhausted - dropping data packet {} for channel {} from {:?}", header.seq, header.channel_id, from);
            return;
        }
        self.on_control(&header, &datagram[PacketHeader::SERIALIZED_LEN..], from).await;
    }

    /// Look up the channel a packet is addressed to. Packets for unknown channels, or from an
    ///  address other than the channel's peer, are dropped.
    async fn channel_for(&self, header: &PacketHeader, from: SocketAddr) -> Option<Arc<ChannelInfo>> {
        let Some(channel) = self.acquire_channel(header.channel_id) else {
            debug!("received {:?} packet from {:?} for unknown channel {} - dropping", header.kind, from, header.channel_id);
            if matches!(header.kind, PacketKind::Data | PacketKind::OpenAck) {
                let close = PacketHeader::new(header.channel_id, SeqNum::ZERO, PacketKind::Close, PacketFlags::empty());
                self.send_control(close, None, from).await;
            }
            return None;
        };
        if channel.peer_addr() != from {
            debug!("received packet for channel {} from {:?}, but the channel's peer is {:?} - dropping", channel.id(), from, channel.peer_addr());
            return None;
        }
        Some(channel)
    }

    async fn on_control(self: &Arc<Self>, header: &PacketHeader, payload: &[u8], from: SocketAddr) {
        if header.kind == PacketKind::Open {
            self.on_open(header.channel_id, payload, from).await;
            return;
        }

        let Some(channel) = self.channel_for(header, from).await else {
            return;
        };

        match header.kind {
            PacketKind::Ack => {
                let released = channel.tx.lock().await
                    .on_ack(header.seq, header.flags.contains(PacketFlags::FLOW_OFF), Instant::now(), &self.pool);
                if released > 0 {
                    channel.tx_room.notify_waiters();
                }
                self.alert_send_task();
            }
            PacketKind::Xon => {
                debug!("channel {}: XON", channel.id());
                channel.tx.lock().await.on_xon();
                self.alert_send_task();
            }
            PacketKind::OpenAck => {
                self.on_open_ack(&channel, payload).await;
            }
            PacketKind::Close => {
                debug!("channel {} closed by peer", channel.id());
                self.finish_channel(&channel, ChannelState::Closed).await;
            }
            PacketKind::Data | PacketKind::Open => {}
        }
    }

    async fn on_data(&self, channel: &Arc<ChannelInfo>, packet: Packet) -> Option<Packet> {
        let arrival = {
            let mut rx = channel.rx.lock().await;
            if channel.state() != ChannelState::Open {
                trace!("channel {} is not open - dropping data", channel.id());
                return Some(packet);
            }
            rx.on_data(packet)
        };

        let mut flags = PacketFlags::empty();
        if arrival.flow_off {
            flags |= PacketFlags::FLOW_OFF;
        }
        let header = PacketHeader::new(channel.id(), arrival.ack_seq, PacketKind::Ack, flags);
        self.send_control(header, None, channel.peer_addr()).await;

        if arrival.stored {
            channel.rx_data.notify_waiters();
        }
        arrival.rejected
    }

    async fn on_open(self: &Arc<Self>, channel_id: u32, payload: &[u8], from: SocketAddr) {
        let peer_params = match OpenParams::deser(&mut &payload[..]) {
            Ok(params) => params,
            Err(e) => {
                debug!("received invalid OPEN from {:?} - dropping: {}", from, e);
                return;
            }
        };

        if let Some(existing) = self.acquire_channel(channel_id) {
            if existing.peer_addr() == from && existing.state() == ChannelState::Open {
                debug!("duplicate OPEN for channel {} from {:?}", channel_id, from);
                self.send_open_ack(&existing).await;
            }
            else {
                debug!("OPEN from {:?} for channel {} which is in use - dropping", from, channel_id);
            }
            return;
        }

        let close = PacketHeader::new(channel_id, SeqNum::ZERO, PacketKind::Close, PacketFlags::empty());
        if !self.is_running() {
            self.send_control(close, None, from).await;
            return;
        }

        let local_max_payload = self.mtu() - PacketHeader::SERIALIZED_LEN;
        let Some((window_size, max_payload)) = self.agree_on_params(local_max_payload, peer_params) else {
            warn!("rejecting channel {} from {:?}: incompatible parameters {:?}", channel_id, from, peer_params);
            self.send_control(close, None, from).await;
            return;
        };

        match self.listener.accept_channel(from, channel_id).await {
            Some(true) => {}
            Some(false) => {
                debug!("listener rejected channel {} from {:?}", channel_id, from);
                self.send_control(close, None, from).await;
                return;
            }
            None => {
                debug!("no listener - rejecting channel {} from {:?}", channel_id, from);
                self.send_control(close, None, from).await;
                return;
            }
        }

        let channel = Arc::new(ChannelInfo::new(
            channel_id,
            from,
            ChannelState::Opening,
            self.config.window_size,
            self.config.xon_threshold,
            max_payload,
        ));
        channel.establish(window_size, max_payload).await;

        {
            let mut channels = self.channels.lock().unwrap();
            if channels.contains_key(&channel_id) {
                debug!("channel {} was created concurrently - dropping OPEN from {:?}", channel_id, from);
                return;
            }
            channels.insert(channel_id, channel.clone());
        }

        info!("accepted channel {} from {:?} (window {}, max payload {})", channel_id, from, window_size, max_payload);
        self.send_open_ack(&channel).await;
        self.listener.on_channel_open(PacketEngineStream::new(self.clone(), &channel)).await;
    }

    async fn send_open_ack(&self, channel: &ChannelInfo) {
        let params = OpenParams {
            window_size: channel.tx.lock().await.window_size(),
            mtu: (channel.max_payload() + PacketHeader::SERIALIZED_LEN).saturating_cast(),
        };
        let header = PacketHeader::new(channel.id(), SeqNum::ZERO, PacketKind::OpenAck, PacketFlags::empty());
        self.send_control(header, Some(params), channel.peer_addr()).await;
    }

    async fn on_open_ack(&self, channel: &Arc<ChannelInfo>, payload: &[u8]) {
        if channel.state() != ChannelState::Opening {
            trace!("channel {}: ignoring OPEN_ACK in state {:?}", channel.id(), channel.state());
            return;
        }

        let agreed = OpenParams::deser(&mut &payload[..]).ok()
            .and_then(|params| self.agree_on_params(channel.max_payload(), params));
        match agreed {
            Some((window_size, max_payload)) => {
                debug!("channel {}: agreed on window {} and max payload {}", channel.id(), window_size, max_payload);
                channel.establish(window_size, max_payload).await;
            }
            None => {
                warn!("channel {}: invalid OPEN_ACK from {:?}", channel.id(), channel.peer_addr());
                self.abort_channel(channel).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use async_trait::async_trait;
    use mockall::predicate::{always, eq};
    use rstest::rstest;
    use tokio::runtime::Builder;
    use tokio::sync::mpsc;
    use crate::listener::MockPacketEngineListener;
    use crate::packet_stream::MockPacketStream;
    use crate::test_util::LoopbackPacketStream;
    use crate::udp_packet_stream::{UdpPacketStream, UdpPacketStreamConfig};

    const MTU: usize = 111;

    fn config() -> PacketEngineConfig {
        PacketEngineConfig {
            window_size: 8,
            xon_threshold: 2,
            packet_pool_size: 64,
            send_timeout: Some(Duration::from_secs(5)),
            retransmit_timeout: Duration::from_millis(50),
            max_retransmits: 5,
            close_linger: Duration::from_millis(500),
        }
    }

    /// Forwards accepted streams to the test
    struct AcceptingListener {
        accept: bool,
        opened: mpsc::UnboundedSender<PacketEngineStream>,
        closed: mpsc::UnboundedSender<u32>,
    }

    #[async_trait]
    impl PacketEngineListener for AcceptingListener {
        async fn accept_channel(&self, _peer_addr: SocketAddr, _channel_id: u32) -> bool {
            self.accept
        }
        async fn on_channel_open(&self, stream: PacketEngineStream) {
            self.opened.send(stream).unwrap();
        }
        async fn on_channel_closed(&self, channel_id: u32) {
            let _ = self.closed.send(channel_id);
        }
    }

    struct Setup {
        a: Arc<PacketEngine>,
        b: Arc<PacketEngine>,
        stream_a: Arc<LoopbackPacketStream>,
        stream_b: Arc<LoopbackPacketStream>,
        opened_b: mpsc::UnboundedReceiver<PacketEngineStream>,
        closed_b: mpsc::UnboundedReceiver<u32>,
    }

    async fn setup(config_a: PacketEngineConfig, config_b: PacketEngineConfig, accept: bool) -> Setup {
        let (stream_a, stream_b) = LoopbackPacketStream::pair(MTU);
        let a = PacketEngine::new(stream_a.clone(), config_a).unwrap();
        let b = PacketEngine::new(stream_b.clone(), config_b).unwrap();

        let (opened_send, opened_b) = mpsc::unbounded_channel();
        let (closed_send, closed_b) = mpsc::unbounded_channel();
        b.set_listener(Some(Arc::new(AcceptingListener { accept, opened: opened_send, closed: closed_send }))).await;

        a.start();
        b.start();
        Setup { a, b, stream_a, stream_b, opened_b, closed_b }
    }

    async fn connect(setup: &mut Setup) -> (PacketEngineStream, PacketEngineStream) {
        let endpoint = PeerEndpoint::new(setup.stream_a.peer_addr());
        let stream_a = setup.a.connect(endpoint, Duration::from_secs(1)).await.unwrap();
        let stream_b = setup.opened_b.recv().await.unwrap();
        (stream_a, stream_b)
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut stream = MockPacketStream::new();
        stream.expect_mtu().return_const(1472usize);
        let result = PacketEngine::new(Arc::new(stream), PacketEngineConfig { window_size: 6, ..config() });
        assert!(result.is_err());
    }

    #[test]
    fn test_new_rejects_tiny_mtu() {
        let mut stream = MockPacketStream::new();
        stream.expect_mtu().return_const(12usize);
        assert!(PacketEngine::new(Arc::new(stream), config()).is_err());
    }

    #[rstest]
    #[case::same(8, 111, Some((8, 100)))]
    #[case::smaller_window(4, 111, Some((4, 100)))]
    #[case::bigger_window(64, 111, Some((8, 100)))]
    #[case::not_power_of_two(7, 111, Some((4, 100)))]
    #[case::window_too_small(2, 111, None)]
    #[case::smaller_mtu(8, 61, Some((8, 50)))]
    #[case::mtu_too_small(8, 11, None)]
    fn test_agree_on_params(#[case] peer_window: u16, #[case] peer_mtu: u16, #[case] expected: Option<(u16, usize)>) {
        let mut stream = MockPacketStream::new();
        stream.expect_mtu().return_const(MTU);
        let engine = PacketEngine::new(Arc::new(stream), config()).unwrap();
        assert_eq!(engine.agree_on_params(100, OpenParams { window_size: peer_window, mtu: peer_mtu }), expected);
    }

    #[test]
    fn test_connect_and_transfer() {
        paused_runtime().block_on(async {
            let mut setup = setup(config(), config(), true).await;
            let (stream_a, stream_b) = connect(&mut setup).await;
            assert_eq!(stream_a.channel_id(), stream_b.channel_id());
            assert_eq!(setup.a.num_channels(), 1);
            assert_eq!(setup.b.num_channels(), 1);

            let msg = (0..250).map(|i| i as u8).collect::<Vec<_>>();
            assert_eq!(stream_a.push(&msg, None).await.unwrap(), 250);

            let mut buf = vec![0u8; 250];
            assert_eq!(stream_b.pull(&mut buf, Some(Duration::from_secs(1))).await.unwrap(), 250);
            assert_eq!(buf, msg);

            // and back
            stream_b.push(b"pong", None).await.unwrap();
            let mut buf = [0u8; 10];
            assert_eq!(stream_a.pull(&mut buf, Some(Duration::from_secs(1))).await.unwrap(), 4);
            assert_eq!(&buf[..4], b"pong");
        });
    }

    #[test]
    fn test_ordered_delivery_with_loss() {
        paused_runtime().block_on(async {
            let mut setup = setup(config(), config(), true).await;
            let (stream_a, stream_b) = connect(&mut setup).await;

            // drop every third data packet on its first transmission
            let mut seen = std::collections::HashSet::new();
            let mut count = 0;
            setup.stream_a.set_drop_predicate(move |buf| {
                let header = PacketHeader::deser(&mut &buf[..]).unwrap();
                if header.kind != PacketKind::Data {
                    return false;
                }
                count += 1;
                count % 3 == 0 && seen.insert(header.seq)
            });

            let sender = tokio::spawn(async move {
                for i in 0..50u8 {
                    stream_a.push(&[i; 150], None).await.unwrap();
                }
                stream_a
            });

            let mut buf = [0u8; 150];
            for i in 0..50u8 {
                assert_eq!(stream_b.pull(&mut buf, Some(Duration::from_secs(5))).await.unwrap(), 150);
                assert!(buf.iter().all(|&b| b == i), "message {}", i);
            }
            sender.await.unwrap();
            assert!(setup.stream_a.num_dropped() > 0);
        });
    }

    #[test]
    fn test_flow_control_resumes() {
        paused_runtime().block_on(async {
            let mut setup = setup(config(), config(), true).await;
            let (stream_a, stream_b) = connect(&mut setup).await;

            // more than two windows' worth, while the receiver is not reading
            let sender = tokio::spawn(async move {
                for i in 0..20u8 {
                    stream_a.push(&[i], None).await.unwrap();
                }
            });
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(!sender.is_finished());
            assert!(setup.b.acquire_channel(stream_b.channel_id()).unwrap().rx.lock().await.is_flow_off());

            let mut buf = [0u8; 1];
            for i in 0..20u8 {
                assert_eq!(stream_b.pull(&mut buf, Some(Duration::from_secs(5))).await.unwrap(), 1);
                assert_eq!(buf[0], i);
            }
            sender.await.unwrap();
        });
    }

    #[test]
    fn test_expired_message_is_skipped() {
        paused_runtime().block_on(async {
            let mut setup = setup(config(), config(), true).await;
            let (stream_a, stream_b) = connect(&mut setup).await;

            stream_a.push(b"stale", Some(Duration::from_millis(100))).await.unwrap();
            stream_a.push(b"fresh", None).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;

            let mut buf = [0u8; 10];
            assert_eq!(stream_b.pull(&mut buf, Some(Duration::from_secs(1))).await.unwrap(), 5);
            assert_eq!(&buf[..5], b"fresh");
        });
    }

    #[test]
    fn test_close_propagates_to_peer() {
        paused_runtime().block_on(async {
            let mut setup = setup(config(), config(), true).await;
            let (stream_a, stream_b) = connect(&mut setup).await;

            stream_a.push(b"last words", None).await.unwrap();
            stream_a.close().await;
            assert_eq!(setup.a.num_channels(), 0);
            assert_eq!(stream_a.push(b"x", None).await, Err(EngineError::PeerClosed));

            assert_eq!(setup.closed_b.recv().await, Some(stream_b.channel_id()));
            assert_eq!(setup.b.num_channels(), 0);
            let mut buf = [0u8; 20];
            assert_eq!(stream_b.pull(&mut buf, Some(Duration::from_secs(1))).await, Err(EngineError::PeerClosed));
        });
    }

    #[test]
    fn test_rejected_channel() {
        paused_runtime().block_on(async {
            let setup = setup(config(), config(), false).await;
            let endpoint = PeerEndpoint::new(setup.stream_a.peer_addr());
            assert_eq!(setup.a.connect(endpoint, Duration::from_secs(1)).await.unwrap_err(), EngineError::PeerClosed);
            assert_eq!(setup.a.num_channels(), 0);
            assert_eq!(setup.b.num_channels(), 0);
        });
    }

    #[test]
    fn test_no_listener_rejects() {
        paused_runtime().block_on(async {
            let setup = setup(config(), config(), true).await;
            setup.b.set_listener(None).await;
            let endpoint = PeerEndpoint::new(setup.stream_a.peer_addr());
            assert_eq!(setup.a.connect(endpoint, Duration::from_secs(1)).await.unwrap_err(), EngineError::PeerClosed);
        });
    }

    #[test]
    fn test_connect_timeout() {
        paused_runtime().block_on(async {
            let setup = setup(config(), config(), true).await;
            setup.stream_a.set_drop_predicate(|_| true);

            let endpoint = PeerEndpoint::new(setup.stream_a.peer_addr());
            let started = Instant::now();
            assert_eq!(setup.a.connect(endpoint, Duration::from_millis(300)).await.unwrap_err(), EngineError::Timeout);
            assert_eq!(started.elapsed(), Duration::from_millis(300));
            assert_eq!(setup.a.num_channels(), 0);
            assert!(setup.stream_a.num_sent() >= 6, "OPEN is resent every retransmit interval");
        });
    }

    #[test]
    fn test_handshake_agrees_on_smaller_window_and_mtu() {
        paused_runtime().block_on(async {
            let mut setup = setup(config(), PacketEngineConfig { window_size: 4, xon_threshold: 1, ..config() }, true).await;
            let endpoint = PeerEndpoint {
                addr: setup.stream_a.peer_addr(),
                mtu: Some(61),
            };
            let stream_a = setup.a.connect(endpoint, Duration::from_secs(1)).await.unwrap();
            let stream_b = setup.opened_b.recv().await.unwrap();

            let channel_a = setup.a.acquire_channel(stream_a.channel_id()).unwrap();
            let channel_b = setup.b.acquire_channel(stream_b.channel_id()).unwrap();
            assert_eq!(channel_a.tx.lock().await.window_size(), 4);
            assert_eq!(channel_b.tx.lock().await.window_size(), 4);
            assert_eq!(channel_a.max_payload(), 50);
            assert_eq!(channel_b.max_payload(), 50);

            // 4 fragments do not fit into a window of 4
            assert_eq!(stream_a.push(&[0u8; 151], None).await, Err(EngineError::MessageTooLarge { len: 151, num_fragments: 4, window_size: 4 }));
            assert_eq!(stream_a.push(&[0u8; 150], None).await, Ok(150));
        });
    }

    #[test]
    fn test_unresponsive_peer_aborts_channel() {
        paused_runtime().block_on(async {
            let mut setup = setup(config(), config(), true).await;
            let (stream_a, _stream_b) = connect(&mut setup).await;

            setup.stream_a.set_drop_predicate(|_| true);
            stream_a.push(b"into the void", None).await.unwrap();

            tokio::time::sleep(Duration::from_secs(2)).await;
            assert_eq!(setup.a.num_channels(), 0);
            assert_eq!(stream_a.push(b"x", None).await, Err(EngineError::PeerClosed));
        });
    }

    #[test]
    fn test_send_failure_surfaces_as_transport_fault() {
        paused_runtime().block_on(async {
            let mut setup = setup(config(), config(), true).await;
            let (stream_a, _stream_b) = connect(&mut setup).await;

            setup.stream_a.set_fail_predicate(|buf| {
                PacketHeader::deser(&mut &buf[..]).map_or(false, |h| h.kind == PacketKind::Data)
            });
            assert_eq!(stream_a.push(b"x", None).await, Ok(1));
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(matches!(stream_a.push(b"y", None).await, Err(EngineError::TransportFault(_))));

            let stream_a = Arc::new(stream_a);
            let s2 = stream_a.clone();
            let pull = tokio::spawn(async move {
                let mut buf = [0u8; 4];
                s2.pull(&mut buf, None).await
            });

            tokio::time::sleep(Duration::from_secs(2)).await;
            assert!(matches!(pull.await.unwrap(), Err(EngineError::TransportFault(_))));
            assert_eq!(setup.a.num_channels(), 0);
        });
    }

    #[test]
    fn test_acks_are_processed_while_pool_is_exhausted() {
        paused_runtime().block_on(async {
            let config_a = PacketEngineConfig { packet_pool_size: 8, max_retransmits: 100, ..config() };
            let mut setup = setup(config_a, config(), true).await;
            let (stream_a, stream_b) = connect(&mut setup).await;

            setup.stream_b.set_drop_predicate(|buf| {
                PacketHeader::deser(&mut &buf[..]).map_or(false, |h| h.kind == PacketKind::Ack)
            });

            // five unacknowledged fragments plus three received packets the application does
            //  not pull take up the whole pool
            assert_eq!(stream_a.push(&[1u8; 500], None).await, Ok(500));
            for i in 0..3u8 {
                stream_b.push(&[i], None).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;

            let channel_a = setup.a.acquire_channel(stream_a.channel_id()).unwrap();
            assert_eq!(setup.a.pool().available(), 0);
            assert_eq!(channel_a.tx.lock().await.in_flight(), 5);

            setup.stream_b.clear_drop_predicate();
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(channel_a.tx.lock().await.is_empty());
            assert!(setup.a.pool().available() > 0);

            let mut buf = [0u8; 1];
            for i in 0..3u8 {
                assert_eq!(stream_a.pull(&mut buf, Some(Duration::from_secs(1))).await, Ok(1));
                assert_eq!(buf[0], i);
            }
        });
    }

    #[test]
    fn test_peer_with_smaller_window_and_large_xon_threshold() {
        paused_runtime().block_on(async {
            let config_a = PacketEngineConfig { window_size: 64, xon_threshold: 8, packet_pool_size: 128, ..config() };
            let config_b = PacketEngineConfig { window_size: 4, xon_threshold: 1, ..config() };
            let mut setup = setup(config_a, config_b, true).await;
            let (stream_a, stream_b) = connect(&mut setup).await;

            let channel_a = setup.a.acquire_channel(stream_a.channel_id()).unwrap();
            assert_eq!(channel_a.rx.lock().await.window_size(), 4);
            assert_eq!(channel_a.rx.lock().await.xon_threshold(), 1);

            for i in 0..3u8 {
                stream_b.push(&[i], None).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;

            let mut buf = [0u8; 1];
            for i in 0..3u8 {
                assert_eq!(stream_a.pull(&mut buf, Some(Duration::from_secs(1))).await, Ok(1));
                assert_eq!(buf[0], i);
            }

            // the window reopened, so more data flows
            stream_b.push(&[3], None).await.unwrap();
            assert_eq!(stream_a.pull(&mut buf, Some(Duration::from_secs(1))).await, Ok(1));
            assert_eq!(buf[0], 3);
        });
    }

    #[test]
    fn test_packets_from_wrong_address_are_ignored() {
        paused_runtime().block_on(async {
            let mut setup = setup(config(), config(), true).await;
            let (_stream_a, stream_b) = connect(&mut setup).await;

            let impostor = SocketAddr::from(([10, 1, 1, 1], 4711));
            let mut packet = setup.b.pool().get_packet().unwrap();
            let raw = PacketHeader::new(stream_b.channel_id(), SeqNum::ZERO, PacketKind::Close, PacketFlags::empty());
            let mut w: &mut [u8] = packet.recv_buf();
            raw.ser(&mut w);
            setup.b.on_datagram(packet, PacketHeader::SERIALIZED_LEN, impostor).await;

            assert_eq!(setup.b.num_channels(), 1);
        });
    }

    #[test]
    fn test_listener_sees_open_and_close() {
        paused_runtime().block_on(async {
            let (stream_a, stream_b) = LoopbackPacketStream::pair(MTU);
            let a = PacketEngine::new(stream_a.clone(), config()).unwrap();
            let b = PacketEngine::new(stream_b.clone(), config()).unwrap();

            let (opened_send, mut opened) = mpsc::unbounded_channel();
            let mut listener = MockPacketEngineListener::new();
            listener.expect_accept_channel()
                .with(eq(stream_a.local_addr()), always())
                .once()
                .return_const(true);
            listener.expect_on_channel_open()
                .once()
                .returning(move |s| opened_send.send(s.channel_id()).unwrap());
            listener.expect_on_channel_closed()
                .once()
                .return_const(());
            b.set_listener(Some(Arc::new(listener))).await;
            a.start();
            b.start();

            let client = a.connect(PeerEndpoint::new(stream_b.local_addr()), Duration::from_secs(1)).await.unwrap();
            assert_eq!(opened.recv().await, Some(client.channel_id()));
            client.close().await;

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(b.num_channels(), 0);
            b.set_listener(None).await;
        });
    }

    #[test]
    fn test_stop_closes_channels() {
        paused_runtime().block_on(async {
            let mut setup = setup(config(), config(), true).await;
            let (stream_a, stream_b) = connect(&mut setup).await;

            setup.a.stop().await;
            assert!(!setup.a.is_running());
            assert_eq!(setup.a.num_channels(), 0);
            assert_eq!(stream_a.push(b"x", None).await, Err(EngineError::PeerClosed));

            let mut buf = [0u8; 4];
            assert_eq!(stream_b.pull(&mut buf, Some(Duration::from_secs(1))).await, Err(EngineError::PeerClosed));

            let endpoint = PeerEndpoint::new(setup.stream_a.peer_addr());
            assert_eq!(setup.a.connect(endpoint, Duration::from_secs(1)).await.unwrap_err(), EngineError::PeerClosed);
        });
    }

    #[test]
    fn test_connect_session() {
        paused_runtime().block_on(async {
            let mut setup = setup(config(), config(), true).await;
            let registry = SessionRegistry::new();
            let session_id = registry.allocate_session(PeerEndpoint::new(setup.stream_a.peer_addr())).unwrap();

            let stream_a = setup.a.connect_session(&registry, session_id, Duration::from_secs(1)).await.unwrap();
            let stream_b = setup.opened_b.recv().await.unwrap();
            assert_eq!(stream_a.channel_id(), stream_b.channel_id());

            registry.deallocate_session(session_id);
            assert_eq!(setup.a.connect_session(&registry, session_id, Duration::from_secs(1)).await.unwrap_err(), EngineError::PeerClosed);
        });
    }

    #[tokio::test]
    async fn test_over_udp() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let udp_a = Arc::new(UdpPacketStream::start(&UdpPacketStreamConfig::new(localhost, 0)).unwrap());
        let udp_b = Arc::new(UdpPacketStream::start(&UdpPacketStreamConfig::new(localhost, 0)).unwrap());
        let addr_b = udp_b.local_addr();

        let a = PacketEngine::new(udp_a, PacketEngineConfig::default_ipv4()).unwrap();
        let b = PacketEngine::new(udp_b, PacketEngineConfig::default_ipv4()).unwrap();
        let (opened_send, mut opened) = mpsc::unbounded_channel();
        let (closed_send, _closed) = mpsc::unbounded_channel();
        b.set_listener(Some(Arc::new(AcceptingListener { accept: true, opened: opened_send, closed: closed_send }))).await;
        a.start();
        b.start();

        let client = a.connect(PeerEndpoint::new(addr_b), Duration::from_secs(5)).await.unwrap();
        let server = opened.recv().await.unwrap();

        let msg = vec![7u8; 10_000];
        client.push(&msg, None).await.unwrap();

        let mut received = Vec::new();
        let mut buf = vec![0u8; 4096];
        while received.len() < msg.len() {
            let n = server.pull(&mut buf, Some(Duration::from_secs(5))).await.unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, msg);

        a.stop().await;
        b.stop().await;
    }
}
