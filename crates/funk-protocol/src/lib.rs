//! Wire protocol for the funk relay: the 5-byte datagram header, the
//! packet-type enum and the channel numbering scheme shared by server
//! and client.

pub mod error;
pub mod packet;
pub mod types;

pub use error::PacketError;
pub use packet::{Packet, PacketType, HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};
