use crate::error::PacketError;
use crate::types::{ChannelId, SequenceNumber, UserId};

/// Datagram packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Encoded (or raw PCM) audio frame.
    Audio = 0,
    /// Keep-alive and latency probe.
    Ping = 1,
    /// Reply to a ping.
    Pong = 2,
    /// Authentication request; payload is the UTF-8 funk key.
    Auth = 3,
    /// Authentication accepted for the header's channel.
    AuthOk = 4,
    /// Authentication rejected; payload is a UTF-8 reason.
    AuthFail = 5,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Result<Self, PacketError> {
        match b {
            0 => Ok(Self::Audio),
            1 => Ok(Self::Ping),
            2 => Ok(Self::Pong),
            3 => Ok(Self::Auth),
            4 => Ok(Self::AuthOk),
            5 => Ok(Self::AuthFail),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

/// Header size: 1 (type) + 1 (channel) + 1 (user) + 2 (sequence) = 5 bytes.
pub const HEADER_SIZE: usize = 5;

/// Maximum size of one datagram. One UDP message carries exactly one packet.
pub const MAX_PACKET_SIZE: usize = 8192;

/// Maximum payload bytes after the header.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Audio parameters shared by the capture and playout pipelines.
pub const SAMPLE_RATE: u32 = 48_000;
pub const FRAME_MS: u32 = 20;
/// Samples per 20 ms mono frame at 48 kHz.
pub const FRAME_SIZE: usize = (SAMPLE_RATE as usize / 1000) * FRAME_MS as usize;
pub const OPUS_BITRATE: i32 = 24_000;

/// One datagram on the wire.
///
/// Wire format (all integers big-endian):
/// ```text
/// [type: u8] [channel: u8] [user: u8] [sequence: u16 BE] [payload: variable]
/// ```
///
/// PING, PONG and AUTH_OK carry an empty payload; AUTH carries the funk key
/// and AUTH_FAIL a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub channel: ChannelId,
    pub user: UserId,
    pub sequence: SequenceNumber,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create an audio frame packet.
    pub fn audio(
        channel: ChannelId,
        user: UserId,
        sequence: SequenceNumber,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            packet_type: PacketType::Audio,
            channel,
            user,
            sequence,
            payload,
        }
    }

    /// Create a keep-alive ping.
    pub fn ping(channel: ChannelId, user: UserId) -> Self {
        Self {
            packet_type: PacketType::Ping,
            channel,
            user,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    /// Create a ping reply.
    pub fn pong(channel: ChannelId, user: UserId) -> Self {
        Self {
            packet_type: PacketType::Pong,
            channel,
            user,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    /// Create an authentication request carrying the funk key.
    pub fn auth(channel: ChannelId, user: UserId, funk_key: &str) -> Self {
        Self {
            packet_type: PacketType::Auth,
            channel,
            user,
            sequence: 0,
            payload: funk_key.as_bytes().to_vec(),
        }
    }

    /// Create an authentication success reply.
    pub fn auth_ok(channel: ChannelId, user: UserId) -> Self {
        Self {
            packet_type: PacketType::AuthOk,
            channel,
            user,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    /// Create an authentication failure reply with a reason string.
    pub fn auth_fail(channel: ChannelId, user: UserId, reason: &str) -> Self {
        Self {
            packet_type: PacketType::AuthFail,
            channel,
            user,
            sequence: 0,
            payload: reason.as_bytes().to_vec(),
        }
    }

    /// Serialize for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.packet_type as u8);
        buf.push(self.channel);
        buf.push(self.user);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialize from raw datagram bytes.
    ///
    /// Fails on truncated headers, unknown type bytes and oversized
    /// datagrams; the caller drops the datagram in every case.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(data.len()));
        }

        let packet_type = PacketType::from_byte(data[0])?;
        let channel = data[1];
        let user = data[2];
        let sequence = u16::from_be_bytes([data[3], data[4]]);
        let payload = data[HEADER_SIZE..].to_vec();

        Ok(Self {
            packet_type,
            channel,
            user,
            sequence,
            payload,
        })
    }

    /// The AUTH_FAIL reason (or AUTH credential) as text, if this packet
    /// carries valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
