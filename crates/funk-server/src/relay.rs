//! The relay engine: classify → authenticate → authorize → reorder →
//! fan-out, plus the periodic reap and traffic ticks.
//!
//! `handle_auth` and `handle_authed` compute the outbound datagrams
//! without touching the socket, so the full pipeline is testable in
//! process; the loop in [`run`] is the only place that sends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};

use funk_protocol::packet::{Packet, PacketType, MAX_PACKET_SIZE};
use funk_protocol::types::ChannelId;

use crate::jitter::JitterBuffer;
use crate::state::{PeerAuth, ServerState};
use crate::store::fingerprint;

/// Reaper cadence.
const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Traffic flush cadence.
const TRAFFIC_INTERVAL: Duration = Duration::from_secs(300);

/// An outbound datagram: destination and bytes.
pub type Outbound = (SocketAddr, Vec<u8>);

/// Run the relay loop until the task is aborted.
///
/// The jitter buffers are owned by this task alone; the reap and traffic
/// ticks are folded into the same loop so the partition has exactly one
/// owner.
pub async fn run(socket: Arc<UdpSocket>, state: Arc<ServerState>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut jitter: HashMap<(ChannelId, SocketAddr), JitterBuffer> = HashMap::new();

    let mut reap_tick = tokio::time::interval(REAP_INTERVAL);
    let mut traffic_tick = tokio::time::interval(TRAFFIC_INTERVAL);
    // The first tick of a tokio interval fires immediately.
    reap_tick.tick().await;
    traffic_tick.tick().await;

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(result) => result,
                    Err(e) => {
                        error!("UDP recv error: {}", e);
                        continue;
                    }
                };
                state.count_in(len);

                let packet = match Packet::from_bytes(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        trace!(src = %src, "dropping malformed packet: {}", e);
                        continue;
                    }
                };

                if packet.packet_type == PacketType::Auth {
                    // AUTH may hit the store; never stall the audio path on it.
                    let state = state.clone();
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        let replies = handle_auth(&state, packet, src).await;
                        send_all(&socket, &state, replies).await;
                    });
                    continue;
                }

                let replies = handle_authed(&state, &mut jitter, packet, src, Instant::now());
                send_all(&socket, &state, replies).await;
            }

            _ = reap_tick.tick() => {
                reap(&state, &mut jitter, Instant::now());
            }

            _ = traffic_tick.tick() => {
                flush_traffic(&state);
            }
        }
    }
}

async fn send_all(socket: &UdpSocket, state: &ServerState, replies: Vec<Outbound>) {
    for (addr, data) in replies {
        match socket.send_to(&data, addr).await {
            Ok(sent) => state.count_out(sent),
            // The peer will be reaped on staleness.
            Err(e) => warn!(dst = %addr, "send failed: {}", e),
        }
    }
}

/// Handle an AUTH packet: resolve the funk key, check the channel grant,
/// record the session and reply.
pub(crate) async fn handle_auth(
    state: &ServerState,
    packet: Packet,
    src: SocketAddr,
) -> Vec<Outbound> {
    let fail = |reason: &str| {
        vec![(
            src,
            Packet::auth_fail(packet.channel, packet.user, reason).to_bytes(),
        )]
    };

    let Some(funk_key) = packet.payload_str().map(str::trim) else {
        warn!(src = %src, "AUTH payload is not UTF-8");
        return fail("Auth error");
    };

    let user = match state.auth.verify(funk_key).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!(src = %src, key = %fingerprint(funk_key), "invalid funk key");
            state.sessions.remove(&src);
            state.registry.remove(src);
            return fail("Invalid funk key");
        }
        Err(e) => {
            error!(src = %src, "auth store failure: {}", e);
            return fail("Auth error");
        }
    };

    if !user.allowed_channels.contains(&packet.channel) {
        // Sessions on other channels stay untouched.
        warn!(
            user = %user.username,
            channel = packet.channel,
            "channel not authorized"
        );
        return fail("Channel not authorized");
    }

    info!(user = %user.username, channel = packet.channel, src = %src, "authenticated");

    state.sessions.insert(
        src,
        PeerAuth {
            user_id: user.id,
            username: user.username,
            allowed: user.allowed_channels,
        },
    );
    state
        .registry
        .register(src, packet.channel, packet.user, Instant::now());
    state.auth.record_connect(user.id, packet.channel, src.ip());

    vec![(
        src,
        Packet::auth_ok(packet.channel, packet.user).to_bytes(),
    )]
}

/// Handle every non-AUTH packet on the hot path. Purely computational:
/// returns the datagrams to send.
pub(crate) fn handle_authed(
    state: &ServerState,
    jitter: &mut HashMap<(ChannelId, SocketAddr), JitterBuffer>,
    packet: Packet,
    src: SocketAddr,
    now: Instant,
) -> Vec<Outbound> {
    let allowed = match state.sessions.get(&src) {
        Some(session) => session.allowed.contains(&packet.channel),
        None => {
            debug!(src = %src, packet_type = ?packet.packet_type, "unauthenticated sender");
            return vec![(
                src,
                Packet::auth_fail(packet.channel, packet.user, "Not authenticated").to_bytes(),
            )];
        }
    };

    if !allowed {
        // No reply: don't leak whether the channel exists.
        return Vec::new();
    }

    state
        .registry
        .register(src, packet.channel, packet.user, now);
    state.registry.touch(src, now);

    match packet.packet_type {
        PacketType::Ping => {
            vec![(src, Packet::pong(packet.channel, packet.user).to_bytes())]
        }
        PacketType::Audio => {
            let buffer = jitter
                .entry((packet.channel, src))
                .or_insert_with(JitterBuffer::new);
            let channel = packet.channel;
            let sequence = packet.sequence;
            let ready = buffer.insert(sequence, packet.to_bytes(), now);
            if ready.is_empty() {
                trace!(buffered = buffer.len(), "holding out-of-order packet");
                return Vec::new();
            }

            let recipients = state.registry.recipients(channel, src);
            let mut out = Vec::with_capacity(ready.len() * recipients.len());
            for data in ready {
                for &addr in &recipients {
                    out.push((addr, data.clone()));
                }
            }
            out
        }
        // Clients have no business sending these; drop.
        _ => Vec::new(),
    }
}

/// Drop stale peers, their sessions and their jitter buffers.
fn reap(
    state: &ServerState,
    jitter: &mut HashMap<(ChannelId, SocketAddr), JitterBuffer>,
    now: Instant,
) {
    let removed = state.registry.reap(now);
    if removed.is_empty() {
        return;
    }

    info!(
        count = removed.len(),
        remaining = state.registry.peer_count(),
        "removed stale clients"
    );
    for (addr, channels) in &removed {
        if let Some((_, session)) = state.sessions.remove(addr) {
            info!(user = %session.username, "logged out");
            for &channel in channels {
                state
                    .auth
                    .record_disconnect(session.user_id, channel, addr.ip());
            }
        }
        jitter.retain(|(_, peer), _| peer != addr);
    }
}

fn flush_traffic(state: &ServerState) {
    let (bytes_in, bytes_out) = state.take_traffic();
    if bytes_in == 0 && bytes_out == 0 {
        return;
    }
    info!(
        bytes_in = %format_bytes(bytes_in),
        bytes_out = %format_bytes(bytes_out),
        "traffic"
    );
    state.auth.record_traffic(bytes_in, bytes_out);
}

/// Flush the counters synchronously; used on shutdown.
pub fn flush_traffic_final(state: &ServerState) {
    let (bytes_in, bytes_out) = state.take_traffic();
    state.auth.flush_traffic_blocking(bytes_in, bytes_out);
}

fn format_bytes(value: u64) -> String {
    let mut float = value as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if float < 1024.0 {
            return format!("{:.2} {}", float, unit);
        }
        float /= 1024.0;
    }
    format!("{:.2} TB", float)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::STALE_AFTER;
    use crate::store::testing::MemoryStore;

    fn test_state() -> ServerState {
        let store = MemoryStore::new()
            .with_user("funk-key-dispatch", 1, "dispatch", &[41, 52], true)
            .with_user("funk-key-patrol-1", 2, "patrol-1", &[41, 52], true)
            .with_user("funk-key-patrol-2", 3, "patrol-2", &[41, 55], true);
        ServerState::new(
            Arc::new(store),
            STALE_AFTER,
            Duration::from_secs(5),
        )
    }

    fn addr(n: u8) -> SocketAddr {
        format!("192.168.1.{}:40000", n).parse().unwrap()
    }

    async fn authed(state: &ServerState, peer: SocketAddr, key: &str, channel: u8, user: u8) {
        let replies = handle_auth(state, Packet::auth(channel, user, key), peer).await;
        assert_eq!(replies.len(), 1);
        let reply = Packet::from_bytes(&replies[0].1).unwrap();
        assert_eq!(reply.packet_type, PacketType::AuthOk);
    }

    #[tokio::test]
    async fn auth_success_replies_auth_ok_and_registers() {
        let state = test_state();
        authed(&state, addr(1), "funk-key-dispatch", 52, 1).await;

        assert!(state.sessions.contains_key(&addr(1)));
        assert!(state.registry.contains(addr(1)));
    }

    #[tokio::test]
    async fn auth_invalid_key_fails_and_forgets_session() {
        let state = test_state();
        authed(&state, addr(1), "funk-key-dispatch", 52, 1).await;

        let replies = handle_auth(&state, Packet::auth(52, 1, "stolen-key"), addr(1)).await;
        let reply = Packet::from_bytes(&replies[0].1).unwrap();
        assert_eq!(reply.packet_type, PacketType::AuthFail);
        assert_eq!(reply.payload_str(), Some("Invalid funk key"));
        assert!(!state.sessions.contains_key(&addr(1)));
        assert!(!state.registry.contains(addr(1)));
    }

    #[tokio::test]
    async fn auth_unauthorized_channel_keeps_existing_session() {
        let state = test_state();
        authed(&state, addr(3), "funk-key-patrol-2", 55, 3).await;

        // 52 is not in patrol-2's grant.
        let replies = handle_auth(&state, Packet::auth(52, 3, "funk-key-patrol-2"), addr(3)).await;
        let reply = Packet::from_bytes(&replies[0].1).unwrap();
        assert_eq!(reply.packet_type, PacketType::AuthFail);
        assert_eq!(reply.payload_str(), Some("Channel not authorized"));

        // The 55 session is not disturbed.
        assert!(state.sessions.contains_key(&addr(3)));
        assert_eq!(state.registry.channels_of(addr(3)), vec![55]);
    }

    #[tokio::test]
    async fn auth_is_idempotent() {
        let state = test_state();
        authed(&state, addr(1), "funk-key-dispatch", 52, 1).await;
        authed(&state, addr(1), "funk-key-dispatch", 52, 1).await;

        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.registry.peer_count(), 1);
    }

    #[tokio::test]
    async fn auth_error_payload_replies_auth_error() {
        let state = test_state();
        let packet = Packet::audio(52, 1, 0, vec![0xFF, 0xFE]);
        let auth_with_junk = Packet {
            packet_type: PacketType::Auth,
            ..packet
        };
        let replies = handle_auth(&state, auth_with_junk, addr(1)).await;
        let reply = Packet::from_bytes(&replies[0].1).unwrap();
        assert_eq!(reply.payload_str(), Some("Auth error"));
    }

    #[tokio::test]
    async fn unauthenticated_audio_is_refused() {
        let state = test_state();
        let mut jitter = HashMap::new();

        let replies = handle_authed(
            &state,
            &mut jitter,
            Packet::audio(52, 9, 0, vec![1, 2, 3]),
            addr(9),
            Instant::now(),
        );
        assert_eq!(replies.len(), 1);
        let reply = Packet::from_bytes(&replies[0].1).unwrap();
        assert_eq!(reply.packet_type, PacketType::AuthFail);
        assert_eq!(reply.payload_str(), Some("Not authenticated"));
    }

    #[tokio::test]
    async fn unauthorized_channel_is_dropped_silently() {
        let state = test_state();
        authed(&state, addr(3), "funk-key-patrol-2", 55, 3).await;
        let mut jitter = HashMap::new();

        // patrol-2 may not use 52; no reply leaks the channel's existence.
        let replies = handle_authed(
            &state,
            &mut jitter,
            Packet::audio(52, 3, 0, vec![1]),
            addr(3),
            Instant::now(),
        );
        assert!(replies.is_empty());
        // The 55 session is untouched.
        assert!(state.sessions.contains_key(&addr(3)));
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let state = test_state();
        authed(&state, addr(1), "funk-key-dispatch", 52, 1).await;
        let mut jitter = HashMap::new();

        let replies = handle_authed(
            &state,
            &mut jitter,
            Packet::ping(52, 1),
            addr(1),
            Instant::now(),
        );
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, addr(1));
        let reply = Packet::from_bytes(&replies[0].1).unwrap();
        assert_eq!(reply.packet_type, PacketType::Pong);
        assert_eq!(reply.channel, 52);
        assert_eq!(reply.user, 1);
    }

    #[tokio::test]
    async fn audio_fans_out_to_channel_peers_except_sender() {
        let state = test_state();
        authed(&state, addr(1), "funk-key-dispatch", 52, 1).await;
        authed(&state, addr(2), "funk-key-patrol-1", 52, 2).await;
        authed(&state, addr(3), "funk-key-patrol-2", 55, 3).await;
        let mut jitter = HashMap::new();

        let now = Instant::now();
        let replies = handle_authed(
            &state,
            &mut jitter,
            Packet::audio(52, 1, 0, vec![0xAA; 960]),
            addr(1),
            now,
        );

        // Only the other peer on 52 receives it.
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, addr(2));
        let forwarded = Packet::from_bytes(&replies[0].1).unwrap();
        assert_eq!(forwarded.packet_type, PacketType::Audio);
        assert_eq!(forwarded.sequence, 0);
        assert_eq!(forwarded.payload.len(), 960);
    }

    #[tokio::test]
    async fn out_of_order_audio_is_reordered_before_fanout() {
        // Scenario: 0, 1, 3, 2, 4 goes out as 0, 1, 2, 3, 4.
        let state = test_state();
        authed(&state, addr(1), "funk-key-dispatch", 52, 1).await;
        authed(&state, addr(2), "funk-key-patrol-1", 52, 2).await;
        let mut jitter = HashMap::new();
        let now = Instant::now();

        let mut received = Vec::new();
        for seq in [0u16, 1, 3, 2, 4] {
            let replies = handle_authed(
                &state,
                &mut jitter,
                Packet::audio(52, 1, seq, vec![seq as u8]),
                addr(1),
                now,
            );
            for (dst, data) in replies {
                assert_eq!(dst, addr(2));
                received.push(Packet::from_bytes(&data).unwrap().sequence);
            }
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn lost_packet_is_skipped_after_max_age() {
        // Scenario: 0,1,3,4,5 arrive; after 200 ms the gap is accepted.
        let state = test_state();
        authed(&state, addr(1), "funk-key-dispatch", 52, 1).await;
        authed(&state, addr(2), "funk-key-patrol-1", 52, 2).await;
        let mut jitter = HashMap::new();
        let now = Instant::now();

        let mut received = Vec::new();
        for seq in [0u16, 1, 3, 4, 5] {
            for (_, data) in handle_authed(
                &state,
                &mut jitter,
                Packet::audio(52, 1, seq, vec![0]),
                addr(1),
                now,
            ) {
                received.push(Packet::from_bytes(&data).unwrap().sequence);
            }
        }
        assert_eq!(received, vec![0, 1]);

        let later = now + crate::jitter::MAX_AGE;
        for (_, data) in handle_authed(
            &state,
            &mut jitter,
            Packet::audio(52, 1, 6, vec![0]),
            addr(1),
            later,
        ) {
            received.push(Packet::from_bytes(&data).unwrap().sequence);
        }
        assert_eq!(received, vec![0, 1, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn wraparound_sequences_stay_in_order() {
        // Scenario: 65534, 65535, 0, 1 forwarded in order.
        let state = test_state();
        authed(&state, addr(1), "funk-key-dispatch", 52, 1).await;
        authed(&state, addr(2), "funk-key-patrol-1", 52, 2).await;
        let mut jitter = HashMap::new();
        let now = Instant::now();

        let mut received = Vec::new();
        for seq in [65_534u16, 65_535, 0, 1] {
            for (_, data) in handle_authed(
                &state,
                &mut jitter,
                Packet::audio(52, 1, seq, vec![0]),
                addr(1),
                now,
            ) {
                received.push(Packet::from_bytes(&data).unwrap().sequence);
            }
        }
        assert_eq!(received, vec![65_534, 65_535, 0, 1]);
    }

    #[tokio::test]
    async fn reap_drops_sessions_and_jitter_buffers() {
        let state = test_state();
        authed(&state, addr(1), "funk-key-dispatch", 52, 1).await;
        authed(&state, addr(2), "funk-key-patrol-1", 52, 2).await;
        let mut jitter = HashMap::new();
        let now = Instant::now();

        // Seed a jitter buffer with a gap so it stays non-empty.
        handle_authed(
            &state,
            &mut jitter,
            Packet::audio(52, 1, 5, vec![0]),
            addr(1),
            now,
        );
        handle_authed(
            &state,
            &mut jitter,
            Packet::audio(52, 1, 7, vec![0]),
            addr(1),
            now,
        );
        assert!(jitter.contains_key(&(52, addr(1))));

        let later = now + STALE_AFTER + Duration::from_secs(1);
        reap(&state, &mut jitter, later);

        assert!(state.sessions.is_empty());
        assert!(jitter.is_empty());
        assert_eq!(state.registry.peer_count(), 0);
    }

    #[tokio::test]
    async fn audio_on_granted_channel_without_prior_auth_for_it_relays() {
        // One AUTH per address establishes the grant set; any granted
        // channel is usable afterwards.
        let state = test_state();
        authed(&state, addr(1), "funk-key-dispatch", 52, 1).await;
        authed(&state, addr(2), "funk-key-patrol-1", 41, 2).await;
        let mut jitter = HashMap::new();

        // dispatch sends on 41 (granted, never AUTHed for it).
        let replies = handle_authed(
            &state,
            &mut jitter,
            Packet::audio(41, 1, 0, vec![9]),
            addr(1),
            Instant::now(),
        );
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, addr(2));
    }

    #[test]
    fn human_readable_bytes() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
