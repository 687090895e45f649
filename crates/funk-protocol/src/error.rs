use thiserror::Error;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet too short: expected at least {expected} bytes, got {got}")]
    TooShort { expected: usize, got: usize },

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("packet too large: {0} bytes")]
    TooLarge(usize),
}
