//! A packet engine multiplexes reliable, ordered, message oriented channels over a single
//!  datagram socket.
//!
//! ## Overview
//!
//! * One [engine::PacketEngine] owns one [packet_stream::PacketStream] (typically a UDP socket,
//!   see [udp_packet_stream]) and any number of channels to any number of peers
//! * Channels are identified by a 32 bit id that is chosen randomly by the side opening the
//!   channel, and they are opened with a handshake (`OPEN` / `OPEN_ACK`) that agrees on window
//!   size and MTU
//! * The abstraction is *messages*: a message is split into fragments of at most `max_payload`
//!   bytes, each travelling in a packet of its own. The receiver reassembles them and delivers
//!   whole messages in order
//! * Messages can carry a time-to-live. Messages that expire before they are sent or delivered
//!   are skipped rather than retransmitted forever
//! * Reliability is based on a sliding window with cumulative ACKs and timeout based
//!   retransmission. Flow control is XOFF / XON driven by the receiver, with window probes to
//!   survive a lost XON
//! * All packet buffers come from a fixed size [buffers::packet_pool::PacketPool]
//!
//! ## Packet structure
//!
//! ```ascii
//!  0: channel id (u32 BE)
//!  4: sequence number (u16 BE)
//!  6: flags (u8)
//!     bit 0:     BOM - first fragment of a message
//!     bit 1:     EOM - last fragment of a message
//!     bit 2:     EXPIRED - payload was dropped by the sender
//!     bit 3:     FLOW_OFF - on ACK: the receiver asks the sender to pause
//!     bits 4-6:  kind (DATA, ACK, XON, OPEN, OPEN_ACK, CLOSE)
//!  7: remaining time-to-live in millis (u32 BE), 0 for 'never expires'
//! 11: payload
//! ```
//!
//! `OPEN` and `OPEN_ACK` carry the sender's window size (u16 BE) and MTU (u16 BE) as payload.
//!  `ACK` and `XON` carry the receiver's fill position in the sequence number field.

pub mod buffers;
pub mod channel;
pub mod config;
pub mod engine;
pub mod engine_stream;
pub mod error;
pub mod listener;
pub mod packet;
pub mod packet_stream;
pub mod safe_converter;
pub mod seq_num;
pub mod session_registry;
#[cfg(unix)]
pub mod socket_pump;
pub mod test_util;
pub mod udp_packet_stream;
