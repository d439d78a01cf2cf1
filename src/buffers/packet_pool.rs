use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, trace};
use crate::buffers::fixed_buffer::FixedBuf;
use crate::error::{EngineError, EngineResult};
use crate::packet::{Packet, PacketHeader};

/// A bounded pool of MTU-sized packets, shared by all channels of an engine.
///
/// The total number of packets in existence is bounded by `max_packets`; each packet holds a
///  permit of the pool's semaphore for as long as it lives. When all permits are taken, callers
///  get [EngineError::ResourceExhausted] (or wait for a bounded time) rather than the pool
///  growing.
///
/// Returning a packet consumes it, so a single owner can not return the same packet twice.
///  Packets that are dropped instead of returned give back their permit, but their buffer is
///  not recycled.
pub struct PacketPool {
    mtu: usize,
    buffers: Mutex<Vec<FixedBuf>>,
    permits: Arc<Semaphore>,
}

impl PacketPool {
    pub fn new(mtu: usize, max_packets: usize) -> PacketPool {
        assert!(mtu > PacketHeader::SERIALIZED_LEN, "MTU of {} does not leave room for a payload", mtu);

        PacketPool {
            mtu,
            buffers: Mutex::new(Vec::with_capacity(max_packets)),
            permits: Arc::new(Semaphore::new(max_packets)),
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn max_payload(&self) -> usize {
        self.mtu - PacketHeader::SERIALIZED_LEN
    }

    /// number of packets that can currently be acquired
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn get_packet(&self) -> EngineResult<Packet> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(Packet::new(self.get_buffer(), permit)),
            Err(_) => {
                debug!("packet pool exhausted");
                Err(EngineError::ResourceExhausted)
            }
        }
    }

    /// Acquire `n` packets or none at all
    pub fn get_packets(&self, n: usize) -> EngineResult<Vec<Packet>> {
        let permits = u32::try_from(n).map_err(|_| EngineError::ResourceExhausted)?;
        match self.permits.clone().try_acquire_many_owned(permits) {
            Ok(mut permit) => {
                let mut result = Vec::with_capacity(n);
                for _ in 0..n {
                    let single = permit.split(1)
                        .expect("permit count was checked on acquisition");
                    result.push(Packet::new(self.get_buffer(), single));
                }
                Ok(result)
            }
            Err(_) => {
                debug!("packet pool exhausted when requesting {} packets", n);
                Err(EngineError::ResourceExhausted)
            }
        }
    }

    /// Wait up to `timeout` for `n` packets to become available, acquiring all of them or none
    pub async fn get_packets_timeout(&self, n: usize, timeout: Duration) -> EngineResult<Vec<Packet>> {
        let permits = u32::try_from(n).map_err(|_| EngineError::ResourceExhausted)?;
        match tokio::time::timeout(timeout, self.permits.clone().acquire_many_owned(permits)).await {
            Ok(Ok(mut permit)) => Ok((0..n)
                .filter_map(|_| permit.split(1))
                .map(|single| Packet::new(self.get_buffer(), single))
                .collect()),
            Ok(Err(_)) => Err(EngineError::PeerClosed),
            Err(_) => {
                debug!("timed out waiting for {} packets", n);
                Err(EngineError::ResourceExhausted)
            }
        }
    }

    fn get_buffer(&self) -> FixedBuf {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        trace!("no buffer in pool: creating new buffer");
        FixedBuf::new(self.mtu)
    }

    pub fn return_packet(&self, packet: Packet) {
        let mut buffer = packet.into_buf();
        assert_eq!(buffer.capacity(), self.mtu,
                   "returned packet does not have the regular capacity of {} bytes, maybe it belongs to a different pool"
                   , self.mtu);

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}
