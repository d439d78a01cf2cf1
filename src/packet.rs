use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::safe_converter::SaturatingCast;
use crate::seq_num::SeqNum;

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct PacketFlags: u8 {
        /// first fragment of a message
        const BOM = 0b0000_0001;
        /// last fragment of a message
        const EOM = 0b0000_0010;
        /// the sender dropped the payload because the packet's ttl had passed before it went out
        const EXPIRED = 0b0000_0100;
        /// on ACK: the receiver asks the sender to pause
        const FLOW_OFF = 0b0000_1000;

        const MASK_KIND = 0b0111_0000;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketKind {
    Data = 0,
    Ack = 1,
    Xon = 2,
    Open = 3,
    OpenAck = 4,
    Close = 5,
}

/// Packet header - all numbers in network byte order (BE):
///
/// ```ascii
///  0: channel id (u32)
///  4: sequence number (u16)
///  6: flags (u8) - bits 0-3 see [PacketFlags], bits 4-6 [PacketKind], bit 7 unused
///  7: remaining ttl in millis (u32), 0 for 'never expires'
/// 11: payload
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub channel_id: u32,
    pub seq: SeqNum,
    pub kind: PacketKind,
    pub flags: PacketFlags,
    pub ttl_millis: u32,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u32>() + size_of::<u16>() + size_of::<u8>() + size_of::<u32>();

    pub fn new(channel_id: u32, seq: SeqNum, kind: PacketKind, flags: PacketFlags) -> PacketHeader {
        PacketHeader {
            channel_id,
            seq,
            kind,
            flags,
            ttl_millis: 0,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let kind: u8 = self.kind.into();
        buf.put_u32(self.channel_id);
        buf.put_u16(self.seq.to_raw());
        buf.put_u8((kind << 4) | (self.flags - PacketFlags::MASK_KIND).bits());
        buf.put_u32(self.ttl_millis);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("packet of {} bytes is shorter than the header", buf.remaining());
        }

        let channel_id = buf.get_u32();
        let seq = SeqNum::from_raw(buf.get_u16());
        let raw_flags = buf.get_u8();
        let ttl_millis = buf.get_u32();

        let kind = PacketKind::try_from((raw_flags & PacketFlags::MASK_KIND.bits()) >> 4)?;
        let flags = PacketFlags::from_bits_truncate(raw_flags) - PacketFlags::MASK_KIND;

        Ok(PacketHeader {
            channel_id,
            seq,
            kind,
            flags,
            ttl_millis,
        })
    }
}

/// Payload of OPEN and OPEN_ACK: the sender's window size and MTU, used to agree on the
///  smaller of both
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenParams {
    pub window_size: u16,
    pub mtu: u16,
}

impl OpenParams {
    pub const SERIALIZED_LEN: usize = 2 * size_of::<u16>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.window_size);
        buf.put_u16(self.mtu);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<OpenParams> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("OPEN payload is too short");
        }
        Ok(OpenParams {
            window_size: buf.get_u16(),
            mtu: buf.get_u16(),
        })
    }
}


/// One MTU-bounded unit on the wire. The packet's buffer holds the full datagram, i.e. the
///  header followed by the payload, so no copying is needed between socket and window.
///
/// Packets are handed out by a [crate::buffers::packet_pool::PacketPool] and hold one of its
///  permits for as long as they live.
pub struct Packet {
    header: PacketHeader,
    buf: FixedBuf,
    expire_at: Option<Instant>,
    _permit: OwnedSemaphorePermit,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{#{}@{}:{:?}{:?} {}b}}", self.header.channel_id, self.header.seq, self.header.kind, self.header.flags, self.payload().len())
    }
}

impl Packet {
    pub(crate) fn new(buf: FixedBuf, permit: OwnedSemaphorePermit) -> Packet {
        Packet {
            header: PacketHeader::new(0, SeqNum::ZERO, PacketKind::Data, PacketFlags::empty()),
            buf,
            expire_at: None,
            _permit: permit,
        }
    }

    pub(crate) fn into_buf(self) -> FixedBuf {
        self.buf
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn channel_id(&self) -> u32 {
        self.header.channel_id
    }

    pub fn seq(&self) -> SeqNum {
        self.header.seq
    }

    pub fn kind(&self) -> PacketKind {
        self.header.kind
    }

    pub fn flags(&self) -> PacketFlags {
        self.header.flags
    }

    pub fn is_bom(&self) -> bool {
        self.header.flags.contains(PacketFlags::BOM)
    }

    pub fn is_eom(&self) -> bool {
        self.header.flags.contains(PacketFlags::EOM)
    }

    pub fn expire_at(&self) -> Option<Instant> {
        self.expire_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.header.flags.contains(PacketFlags::EXPIRED)
            || self.expire_at.is_some_and(|t| t < now)
    }

    pub fn payload(&self) -> &[u8] {
        let raw = self.buf.as_ref();
        if raw.len() <= PacketHeader::SERIALIZED_LEN {
            &[]
        }
        else {
            &raw[PacketHeader::SERIALIZED_LEN..]
        }
    }

    /// Initialize this packet with a header and payload. The header is only rendered into the
    ///  buffer when the packet is sent, since the remaining ttl depends on the time of sending.
    pub(crate) fn init(&mut self, header: PacketHeader, expire_at: Option<Instant>, payload: &[u8]) {
        self.header = header;
        self.expire_at = expire_at;
        self.buf.clear();
        self.buf.put_bytes(0, PacketHeader::SERIALIZED_LEN);
        self.buf.put_slice(payload);
    }

    /// Render the header into the buffer and return the bytes to go on the wire. With
    ///  `drop_payload`, the packet is sent without its payload and flagged EXPIRED, which keeps
    ///  the sequence space contiguous for the receiver.
    pub(crate) fn encode_for_send(&mut self, now: Instant, drop_payload: bool) -> &[u8] {
        let mut header = self.header;
        let mut wire_len = self.buf.len();

        if drop_payload {
            header.flags |= PacketFlags::EXPIRED;
            header.ttl_millis = 1;
            wire_len = PacketHeader::SERIALIZED_LEN;
        }
        else if let Some(expire_at) = self.expire_at {
            let remaining: u32 = expire_at.saturating_duration_since(now).as_millis().saturating_cast();
            header.ttl_millis = remaining.max(1);
        }

        let mut header_buf: &mut [u8] = &mut self.buf.as_mut()[..PacketHeader::SERIALIZED_LEN];
        header.ser(&mut header_buf);
        &self.buf.as_ref()[..wire_len]
    }

    /// the full buffer to receive a datagram into
    pub(crate) fn recv_buf(&mut self) -> &mut [u8] {
        self.buf.maximize_len();
        self.buf.as_mut()
    }

    /// parse a datagram of `len` bytes that was received into [Packet::recv_buf]
    pub(crate) fn decode_received(&mut self, len: usize, now: Instant) -> anyhow::Result<()> {
        self.buf.truncate(len);
        let header = PacketHeader::deser(&mut self.buf.as_ref())?;

        self.expire_at = match header.ttl_millis {
            0 => None,
            ttl => Some(now + std::time::Duration::from_millis(ttl.into())),
        };
        self.header = header;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use rstest::rstest;
    use tokio::sync::Semaphore;

    fn new_packet(capacity: usize) -> Packet {
        let permit = Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap();
        Packet::new(FixedBuf::new(capacity), permit)
    }

    #[rstest]
    #[case::data_bom(PacketHeader { channel_id: 5, seq: SeqNum::from_raw(3), kind: PacketKind::Data, flags: PacketFlags::BOM, ttl_millis: 0 }, vec![0,0,0,5, 0,3, 0b0000_0001, 0,0,0,0])]
    #[case::data_single(PacketHeader { channel_id: 0x01020304, seq: SeqNum::from_raw(0x0506), kind: PacketKind::Data, flags: PacketFlags::BOM | PacketFlags::EOM, ttl_millis: 300 }, vec![1,2,3,4, 5,6, 0b0000_0011, 0,0,1,44])]
    #[case::ack_flow_off(PacketHeader { channel_id: 9, seq: SeqNum::from_raw(65535), kind: PacketKind::Ack, flags: PacketFlags::FLOW_OFF, ttl_millis: 0 }, vec![0,0,0,9, 255,255, 0b0001_1000, 0,0,0,0])]
    #[case::xon(PacketHeader { channel_id: 9, seq: SeqNum::from_raw(1), kind: PacketKind::Xon, flags: PacketFlags::empty(), ttl_millis: 0 }, vec![0,0,0,9, 0,1, 0b0010_0000, 0,0,0,0])]
    #[case::close(PacketHeader { channel_id: 1, seq: SeqNum::ZERO, kind: PacketKind::Close, flags: PacketFlags::empty(), ttl_millis: 0 }, vec![0,0,0,1, 0,0, 0b0101_0000, 0,0,0,0])]
    fn test_header_ser(#[case] header: PacketHeader, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        header.ser(&mut buf);
        assert_eq!(buf, expected);

        let mut b: &[u8] = &buf;
        let deser = PacketHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[rstest]
    #[case::too_short(vec![0,0,0,1, 0,0, 0])]
    #[case::unknown_kind(vec![0,0,0,1, 0,0, 0b0111_0000, 0,0,0,0])]
    fn test_header_deser_invalid(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(PacketHeader::deser(&mut b).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_encode_for_send_with_remaining_ttl() {
        let now = Instant::now();
        let mut packet = new_packet(32);
        packet.init(
            PacketHeader::new(7, SeqNum::from_raw(2), PacketKind::Data, PacketFlags::EOM),
            Some(now + Duration::from_millis(250)),
            &[9, 8, 7],
        );

        let wire = packet.encode_for_send(now + Duration::from_millis(50), false).to_vec();
        assert_eq!(wire, vec![0,0,0,7, 0,2, 0b0000_0010, 0,0,0,200, 9,8,7]);
        assert_eq!(packet.payload(), &[9, 8, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_encode_for_send_expired_drops_payload() {
        let now = Instant::now();
        let mut packet = new_packet(32);
        packet.init(
            PacketHeader::new(7, SeqNum::from_raw(2), PacketKind::Data, PacketFlags::BOM),
            Some(now + Duration::from_millis(10)),
            &[1, 2, 3, 4],
        );

        assert!(packet.is_expired(now + Duration::from_millis(11)));
        let wire = packet.encode_for_send(now + Duration::from_millis(11), true).to_vec();
        assert_eq!(wire, vec![0,0,0,7, 0,2, 0b0000_0101, 0,0,0,1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_encode_for_send_late_fragment_keeps_payload() {
        let now = Instant::now();
        let mut packet = new_packet(32);
        packet.init(
            PacketHeader::new(7, SeqNum::from_raw(3), PacketKind::Data, PacketFlags::EOM),
            Some(now),
            &[5],
        );

        let wire = packet.encode_for_send(now + Duration::from_millis(20), false).to_vec();
        assert_eq!(wire, vec![0,0,0,7, 0,3, 0b0000_0010, 0,0,0,1, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_received() {
        let now = Instant::now();
        let mut packet = new_packet(32);
        let raw = [0,0,0,7, 0,2, 0b0000_0011, 0,0,0,100, 1,2];
        packet.recv_buf()[..raw.len()].copy_from_slice(&raw);
        packet.decode_received(raw.len(), now).unwrap();

        assert_eq!(packet.channel_id(), 7);
        assert_eq!(packet.seq(), SeqNum::from_raw(2));
        assert!(packet.is_bom());
        assert!(packet.is_eom());
        assert_eq!(packet.payload(), &[1, 2]);
        assert_eq!(packet.expire_at(), Some(now + Duration::from_millis(100)));
        assert!(!packet.is_expired(now + Duration::from_millis(100)));
        assert!(packet.is_expired(now + Duration::from_millis(101)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_received_expired_flag() {
        let now = Instant::now();
        let mut packet = new_packet(32);
        let raw = [0,0,0,7, 0,2, 0b0000_0101, 0,0,0,1];
        packet.recv_buf()[..raw.len()].copy_from_slice(&raw);
        packet.decode_received(raw.len(), now).unwrap();

        assert!(packet.is_expired(now));
        assert!(packet.payload().is_empty());
    }

    #[test]
    fn test_open_params() {
        let mut buf = Vec::new();
        OpenParams { window_size: 64, mtu: 1472 }.ser(&mut buf);
        assert_eq!(buf, vec![0,64, 5,192]);
        assert_eq!(OpenParams::deser(&mut buf.as_slice()).unwrap(), OpenParams { window_size: 64, mtu: 1472 });
    }
}
