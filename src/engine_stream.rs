use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::channel::{ChannelInfo, ChannelState};
use crate::engine::PacketEngine;
use crate::error::{EngineError, EngineResult};
use crate::safe_converter::SafeCast;

/// An application's handle to one channel, with blocking (i.e. async) `pull` and `push`.
///
/// The stream does not own the channel: each operation looks the channel up in the engine and
///  holds on to it only for the duration of the call. Once the channel is closed (locally or by
///  the peer), all operations fail with [EngineError::PeerClosed].
pub struct PacketEngineStream {
    engine: Arc<PacketEngine>,
    channel_id: u32,
    peer_addr: SocketAddr,
    send_timeout: Option<Duration>,
}

impl Debug for PacketEngineStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PacketEngineStream{{#{}@{:?}}}", self.channel_id, self.peer_addr)
    }
}

impl PartialEq for PacketEngineStream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine) && self.channel_id == other.channel_id
    }
}

impl PacketEngineStream {
    pub(crate) fn new(engine: Arc<PacketEngine>, channel: &ChannelInfo) -> PacketEngineStream {
        let send_timeout = engine.config().send_timeout;
        PacketEngineStream {
            engine,
            channel_id: channel.id(),
            peer_addr: channel.peer_addr(),
            send_timeout,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout
    }

    /// bound for how long `push` waits for room in the send window, `None` for no bound
    pub fn set_send_timeout(&mut self, send_timeout: Option<Duration>) {
        self.send_timeout = send_timeout;
    }

    pub(crate) fn engine(&self) -> &Arc<PacketEngine> {
        &self.engine
    }

    pub fn state(&self) -> ChannelState {
        self.engine.acquire_channel(self.channel_id)
            .map(|c| c.state())
            .unwrap_or(ChannelState::Closed)
    }

    fn acquire(&self) -> EngineResult<Arc<ChannelInfo>> {
        self.engine.acquire_channel(self.channel_id)
            .ok_or(EngineError::PeerClosed)
    }

    /// The longest message that can be pushed in one piece
    pub async fn max_message_len(&self) -> EngineResult<usize> {
        let channel = self.acquire()?;
        let max_fragments: usize = (channel.tx.lock().await.window_size() - 1).safe_cast();
        Ok(max_fragments * channel.max_payload())
    }

    /// Read received data into `buf`, waiting up to `timeout` (forever for `None`) if none is
    ///  available. This returns fewer bytes than requested at the end of a message.
    ///
    /// Messages that expired before the application got to them are skipped as a whole.
    pub async fn pull(&self, buf: &mut [u8], timeout: Option<Duration>) -> EngineResult<usize> {
        let channel = self.acquire()?;
        channel.check_open()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let data_available = channel.rx_data.notified();
            tokio::pin!(data_available);
            data_available.as_mut().enable();

            channel.check_open()?;

            let (result, had_data, xon_seq) = {
                let pool = self.engine.pool();
                let mut rx = channel.rx.lock().await;

                match rx.skip_expired(Instant::now(), pool) {
                    Ok(_) => {
                        let had_data = rx.has_data();
                        let mut send_xon = rx.check_xon();
                        let copied = if had_data {
                            rx.copy_out(buf, pool)
                        }
                        else {
                            Ok(0)
                        };
                        send_xon |= rx.check_xon();
                        (copied, had_data, send_xon.then(|| rx.fill()))
                    }
                    Err(e) => (Err(e), false, None),
                }
            };

            if let Some(rx_fill) = xon_seq {
                self.engine.send_xon(&channel, rx_fill).await;
            }

            match result {
                Ok(0) if had_data => continue,
                Ok(0) => {}
                Ok(n) => {
                    trace!("channel {}: pulled {} bytes", self.channel_id, n);
                    return Ok(n);
                }
                Err(e) => {
                    self.engine.abort_channel(&channel).await;
                    return Err(e);
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, data_available).await.is_err() {
                        return Err(EngineError::Timeout);
                    }
                }
                None => data_available.await,
            }
        }
    }

    /// Send `buf` as one message, which is enqueued as a whole or not at all. This waits for
    ///  room in the send window for up to the send timeout.
    ///
    /// With a `ttl`, the message is discarded (by sender or receiver) if it is not delivered in
    ///  time. If the wait for room in the window ends because the ttl passed, that counts as
    ///  success: the message would have expired anyway.
    ///
    /// If sending previously pushed data failed in the underlying packet stream, this reports
    ///  that failure once and enqueues nothing.
    pub async fn push(&self, buf: &[u8], ttl: Option<Duration>) -> EngineResult<usize> {
        let channel = self.acquire()?;
        channel.check_open()?;
        if let Some(e) = channel.take_send_error() {
            debug!("channel {}: reporting failure to send earlier data", self.channel_id);
            return Err(e);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let max_payload = channel.max_payload();
        let num_fragments = buf.len().div_ceil(max_payload);
        let window_size = channel.tx.lock().await.window_size();
        let window_len: usize = window_size.safe_cast();
        if num_fragments >= window_len {
            debug!("channel {}: message of {} bytes does not fit into the window", self.channel_id, buf.len());
            return Err(EngineError::MessageTooLarge { len: buf.len(), num_fragments, window_size });
        }

        let wait_bound = match (self.send_timeout, ttl) {
            (Some(send_timeout), Some(ttl)) => Some(send_timeout.min(ttl)),
            (send_timeout, ttl) => send_timeout.or(ttl),
        };
        let deadline = wait_bound.map(|b| Instant::now() + b);

        loop {
            let room = channel.tx_room.notified();
            tokio::pin!(room);
            room.as_mut().enable();

            let has_room = {
                let tx = channel.tx.lock().await;
                channel.check_open()?;
                let free: usize = tx.room().safe_cast();
                free >= num_fragments
            };

            if has_room {
                // packets are acquired without holding the window lock: waiting for them
                //  must not block ACK processing, which is what returns packets to the pool
                let pool = self.engine.pool();
                let packets = match deadline {
                    Some(deadline) => pool.get_packets_timeout(num_fragments, deadline.saturating_duration_since(Instant::now())).await?,
                    None => pool.get_packets(num_fragments)?,
                };

                let mut tx = channel.tx.lock().await;
                if let Err(e) = channel.check_open() {
                    packets.into_iter().for_each(|p| pool.return_packet(p));
                    return Err(e);
                }
                let free: usize = tx.room().safe_cast();
                if free >= num_fragments {
                    let expire_at = ttl.map(|ttl| Instant::now() + ttl);
                    tx.enqueue(self.channel_id, buf, max_payload, expire_at, packets);
                    break;
                }
                trace!("channel {}: window filled up while acquiring packets - retrying", self.channel_id);
                packets.into_iter().for_each(|p| pool.return_packet(p));
                continue;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, room).await.is_err() {
                        if ttl.is_some() && wait_bound == ttl {
                            debug!("channel {}: ttl passed while waiting for room in the window - discarding message", self.channel_id);
                            return Ok(buf.len());
                        }
                        return Err(EngineError::Timeout);
                    }
                }
                None => room.await,
            }
        }

        trace!("channel {}: pushed {} bytes in {} packets", self.channel_id, buf.len(), num_fragments);
        self.engine.alert_send_task();
        Ok(buf.len())
    }

    /// Close the channel, giving sent data a chance to be acknowledged first
    pub async fn close(&self) {
        self.engine.disconnect(self.channel_id).await;
    }
}
