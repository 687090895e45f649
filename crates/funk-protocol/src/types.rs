use std::ops::RangeInclusive;

/// Channel identifier carried in the packet header.
pub type ChannelId = u8;

/// User identifier carried in the packet header.
pub type UserId = u8;

/// Per-sender audio sequence number, wraps at 65 536.
pub type SequenceNumber = u16;

/// Public channels any user may be granted.
pub const PUBLIC_CHANNELS: RangeInclusive<ChannelId> = 41..=43;

/// Restricted channels, granted per user.
pub const RESTRICTED_CHANNELS: RangeInclusive<ChannelId> = 51..=69;

/// The common/emergency channel. Every client keeps a second authenticated
/// session on it; it is never selectable as a primary channel.
pub const EMERGENCY_CHANNEL: ChannelId = 41;

/// Whether a channel id exists in the channel plan at all.
pub fn is_known_channel(channel: ChannelId) -> bool {
    PUBLIC_CHANNELS.contains(&channel) || RESTRICTED_CHANNELS.contains(&channel)
}

/// Whether a channel may be configured as a client's primary channel.
pub fn is_valid_primary(channel: ChannelId) -> bool {
    is_known_channel(channel) && channel != EMERGENCY_CHANNEL
}

/// The full channel plan, public channels first.
pub fn all_channels() -> Vec<ChannelId> {
    PUBLIC_CHANNELS.chain(RESTRICTED_CHANNELS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_plan_membership() {
        assert!(is_known_channel(41));
        assert!(is_known_channel(43));
        assert!(is_known_channel(51));
        assert!(is_known_channel(69));
        assert!(!is_known_channel(40));
        assert!(!is_known_channel(44));
        assert!(!is_known_channel(50));
        assert!(!is_known_channel(70));
        assert!(!is_known_channel(0));
    }

    #[test]
    fn emergency_channel_is_not_a_primary() {
        assert!(!is_valid_primary(EMERGENCY_CHANNEL));
        assert!(is_valid_primary(42));
        assert!(is_valid_primary(52));
    }

    #[test]
    fn all_channels_count() {
        let channels = all_channels();
        assert_eq!(channels.len(), 3 + 19);
        assert_eq!(channels[0], 41);
        assert_eq!(*channels.last().unwrap(), 69);
    }
}
