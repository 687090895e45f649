//! The client connection session.
//!
//! One owner task multiplexes the socket, the keep-alive ticker, the
//! watchdog ticker and the command channel; all session state lives inside
//! that task. The supervisor loop around it drives reconnection with
//! exponential backoff.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use funk_protocol::packet::{Packet, PacketType, MAX_PACKET_SIZE};
use funk_protocol::types::{ChannelId, UserId, EMERGENCY_CHANNEL};

use crate::quality::{ConnectionQuality, QualitySnapshot};

/// PING cadence on the primary channel.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// Silence ages for the watchdog.
const WARN_AFTER: Duration = Duration::from_secs(7);
const LOST_AFTER: Duration = Duration::from_secs(10);

/// How long an attempt may sit in Authenticating before it is abandoned.
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect backoff ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Reconnect delay for the given attempt count: 1, 2, 4, 8, 16, 30, 30, …
pub fn backoff_delay(attempts: u32) -> Duration {
    let secs = 1u64 << attempts.min(6);
    Duration::from_secs(secs.min(MAX_BACKOFF.as_secs()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Authenticating,
    Connected,
    Reconnecting,
}

#[derive(Debug)]
pub enum SessionEvent {
    StateChanged(SessionState),
    AuthFailed { reason: String },
    Audio {
        channel: ChannelId,
        user: UserId,
        payload: Vec<u8>,
    },
    Quality(QualitySnapshot),
}

#[derive(Debug)]
pub enum SessionCommand {
    /// Transmit one encoded audio frame on the current transmit channel.
    SendAudio(Vec<u8>),
    /// Settings change: new primary channel, re-authenticates it.
    SetChannel(ChannelId),
    /// Hotkey switch: change the transmit channel without re-auth.
    SetTransmitChannel(ChannelId),
    /// Intentional disconnect; suppresses reconnection.
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_addr: SocketAddr,
    pub primary_channel: ChannelId,
    pub user_id: UserId,
    pub funk_key: String,
}

pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    quality: Arc<Mutex<ConnectionQuality>>,
    task: tokio::task::JoinHandle<()>,
}

impl SessionHandle {
    pub fn commands(&self) -> mpsc::Sender<SessionCommand> {
        self.commands.clone()
    }

    pub async fn disconnect(&self) {
        let _ = self.commands.send(SessionCommand::Disconnect).await;
    }

    pub fn quality(&self) -> QualitySnapshot {
        lock_quality(&self.quality).snapshot()
    }

    /// Wait for the session task to finish (after a disconnect).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

fn lock_quality(quality: &Mutex<ConnectionQuality>) -> std::sync::MutexGuard<'_, ConnectionQuality> {
    quality.lock().unwrap_or_else(|poisoned| {
        warn!("quality mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Start the session task. Events arrive on `events`; control goes through
/// the returned handle.
pub fn spawn(config: SessionConfig, events: mpsc::Sender<SessionEvent>) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let quality = Arc::new(Mutex::new(ConnectionQuality::new()));
    let task = tokio::spawn(run_session(config, cmd_rx, events, quality.clone()));
    SessionHandle {
        commands: cmd_tx,
        quality,
        task,
    }
}

enum ConnectionEnd {
    /// User asked; no reconnect.
    Intentional,
    /// The server rejected the credential or channel; no reconnect.
    AuthRejected,
    /// Watchdog or socket failure; reconnect with backoff.
    Lost,
}

async fn run_session(
    mut config: SessionConfig,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
    quality: Arc<Mutex<ConnectionQuality>>,
) {
    let mut attempts: u32 = 0;

    loop {
        let (end, primary) =
            run_connection(&config, &mut commands, &events, &quality, &mut attempts).await;
        config.primary_channel = primary;

        match end {
            ConnectionEnd::Intentional | ConnectionEnd::AuthRejected => break,
            ConnectionEnd::Lost => {
                if events
                    .send(SessionEvent::StateChanged(SessionState::Reconnecting))
                    .await
                    .is_err()
                {
                    break;
                }

                let delay = backoff_delay(attempts);
                attempts += 1;
                info!(
                    delay_secs = delay.as_secs(),
                    attempt = attempts,
                    "reconnect scheduled"
                );

                let wait_for_disconnect = async {
                    loop {
                        match commands.recv().await {
                            Some(SessionCommand::Disconnect) | None => return,
                            // Frames and switches are meaningless while down.
                            Some(_) => continue,
                        }
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_disconnect => break,
                }
            }
        }
    }

    let _ = events
        .send(SessionEvent::StateChanged(SessionState::Disconnected))
        .await;
}

struct Connection {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    primary: ChannelId,
    user: UserId,
    funk_key: String,
    transmit_channel: ChannelId,
    sequence: u16,
    authed_channels: HashSet<ChannelId>,
    confirmed: bool,
    last_received: Instant,
    ping_sent: Option<Instant>,
    started: Instant,
    quality: Arc<Mutex<ConnectionQuality>>,
    events: mpsc::Sender<SessionEvent>,
}

async fn run_connection(
    config: &SessionConfig,
    commands: &mut mpsc::Receiver<SessionCommand>,
    events: &mpsc::Sender<SessionEvent>,
    quality: &Arc<Mutex<ConnectionQuality>>,
    attempts: &mut u32,
) -> (ConnectionEnd, ChannelId) {
    let socket = match bind_socket().await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            error!("socket setup failed: {}", e);
            return (ConnectionEnd::Lost, config.primary_channel);
        }
    };

    *lock_quality(quality) = ConnectionQuality::new();
    let _ = events
        .send(SessionEvent::StateChanged(SessionState::Authenticating))
        .await;

    let now = Instant::now();
    let mut conn = Connection {
        socket: socket.clone(),
        server: config.server_addr,
        primary: config.primary_channel,
        user: config.user_id,
        funk_key: config.funk_key.clone(),
        transmit_channel: config.primary_channel,
        sequence: 0,
        authed_channels: HashSet::new(),
        confirmed: false,
        last_received: now,
        ping_sent: None,
        started: now,
        quality: quality.clone(),
        events: events.clone(),
    };

    // Authenticate the primary and the common channel in parallel;
    // Connected is the conjunction of both AUTH_OKs.
    let primary = conn.primary;
    conn.send_auth(primary).await;
    conn.send_auth(EMERGENCY_CHANNEL).await;

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
    keepalive.tick().await;
    watchdog.tick().await;

    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, _src)) => match Packet::from_bytes(&buf[..len]) {
                        Ok(packet) => {
                            if let Some(end) = conn.on_packet(packet, attempts).await {
                                return (end, conn.primary);
                            }
                        }
                        Err(e) => debug!("dropping malformed packet: {}", e),
                    },
                    Err(e) => {
                        error!("socket recv error: {}", e);
                        return (ConnectionEnd::Lost, conn.primary);
                    }
                }
            }

            _ = keepalive.tick() => {
                conn.on_keepalive().await;
            }

            _ = watchdog.tick() => {
                if let Some(end) = conn.on_watchdog() {
                    return (end, conn.primary);
                }
            }

            cmd = commands.recv() => {
                match cmd {
                    None => return (ConnectionEnd::Intentional, conn.primary),
                    Some(cmd) => {
                        if let Some(end) = conn.on_command(cmd).await {
                            return (end, conn.primary);
                        }
                    }
                }
            }
        }
    }
}

async fn bind_socket() -> Result<UdpSocket> {
    let sock = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .context("failed to create UDP socket")?;
    let _ = sock.set_recv_buffer_size(512 * 1024);
    let _ = sock.set_send_buffer_size(512 * 1024);
    sock.bind(&"0.0.0.0:0".parse::<SocketAddr>()?.into())
        .context("failed to bind UDP socket")?;
    sock.set_nonblocking(true)
        .context("failed to set non-blocking")?;
    let std_sock: std::net::UdpSocket = sock.into();
    UdpSocket::from_std(std_sock).context("failed to wrap UDP socket in tokio")
}

impl Connection {
    fn quality(&self) -> std::sync::MutexGuard<'_, ConnectionQuality> {
        lock_quality(&self.quality)
    }

    fn authed(&self, channel: ChannelId) -> bool {
        self.authed_channels.contains(&channel)
    }

    async fn send(&self, packet: Packet) {
        match self.socket.send_to(&packet.to_bytes(), self.server).await {
            Ok(_) => self.quality().on_sent(),
            Err(e) => {
                error!("send failed: {}", e);
                self.quality().on_send_error();
            }
        }
    }

    async fn send_auth(&self, channel: ChannelId) {
        info!(channel, "sending authentication");
        self.send(Packet::auth(channel, self.user, &self.funk_key))
            .await;
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }

    async fn on_packet(&mut self, packet: Packet, attempts: &mut u32) -> Option<ConnectionEnd> {
        self.last_received = Instant::now();
        self.quality().on_received();

        match packet.packet_type {
            PacketType::AuthOk => {
                info!(channel = packet.channel, "channel authenticated");
                self.authed_channels.insert(packet.channel);
                *attempts = 0;
                self.quality().reset_signal();

                if !self.confirmed
                    && self.authed(self.primary)
                    && self.authed(EMERGENCY_CHANNEL)
                {
                    self.confirmed = true;
                    info!("both channels authenticated, session up");
                    self.emit(SessionEvent::StateChanged(SessionState::Connected))
                        .await;
                }
                None
            }

            PacketType::AuthFail => {
                let reason = packet
                    .payload_str()
                    .unwrap_or("unknown error")
                    .to_owned();
                error!(%reason, "authentication failed");
                self.emit(SessionEvent::AuthFailed { reason }).await;
                Some(ConnectionEnd::AuthRejected)
            }

            PacketType::Pong => {
                if let Some(sent) = self.ping_sent.take() {
                    let rtt = sent.elapsed();
                    let mut quality = self.quality();
                    quality.record_rtt(rtt);
                    debug!(
                        latency_ms = quality.snapshot().latency_ms,
                        jitter_ms = quality.snapshot().jitter_ms,
                        "pong received"
                    );
                }
                None
            }

            PacketType::Audio => {
                if !packet.payload.is_empty() {
                    self.emit(SessionEvent::Audio {
                        channel: packet.channel,
                        user: packet.user,
                        payload: packet.payload,
                    })
                    .await;
                }
                None
            }

            // The server never sends these to us.
            PacketType::Ping | PacketType::Auth => None,
        }
    }

    async fn on_keepalive(&mut self) {
        self.ping_sent = Some(Instant::now());
        self.send(Packet::ping(self.primary, self.user)).await;

        let snapshot = {
            let mut quality = self.quality();
            quality.update_loss();
            quality.snapshot()
        };
        self.emit(SessionEvent::Quality(snapshot)).await;
    }

    fn on_watchdog(&mut self) -> Option<ConnectionEnd> {
        let age = self.last_received.elapsed();
        self.quality().observe_age(age);

        if age >= LOST_AFTER {
            error!(
                silent_secs = age.as_secs(),
                "connection lost, no packets from server"
            );
            return Some(ConnectionEnd::Lost);
        }
        if age > WARN_AFTER {
            debug!(silent_secs = age.as_secs(), "weak connection");
        }
        if !self.confirmed && self.started.elapsed() > AUTH_TIMEOUT {
            warn!("authentication timed out");
            return Some(ConnectionEnd::Lost);
        }
        None
    }

    async fn on_command(&mut self, cmd: SessionCommand) -> Option<ConnectionEnd> {
        match cmd {
            SessionCommand::SendAudio(payload) => {
                if !self.authed(self.transmit_channel) {
                    debug!(
                        channel = self.transmit_channel,
                        "dropping frame, channel not authenticated"
                    );
                    return None;
                }
                let packet =
                    Packet::audio(self.transmit_channel, self.user, self.sequence, payload);
                self.sequence = self.sequence.wrapping_add(1);
                self.send(packet).await;
                None
            }

            SessionCommand::SetChannel(channel) => {
                if channel != self.primary {
                    info!(old = self.primary, new = channel, "primary channel changed");
                    self.primary = channel;
                    self.transmit_channel = channel;
                    if !self.authed(channel) {
                        self.confirmed = false;
                        self.emit(SessionEvent::StateChanged(SessionState::Authenticating))
                            .await;
                        self.send_auth(channel).await;
                    }
                }
                None
            }

            SessionCommand::SetTransmitChannel(channel) => {
                if self.authed(channel) {
                    debug!(channel, "transmit channel switched");
                    self.transmit_channel = channel;
                } else {
                    warn!(channel, "transmit switch refused, channel not authenticated");
                }
                None
            }

            SessionCommand::Disconnect => {
                info!("intentional disconnect");
                Some(ConnectionEnd::Intentional)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const TEST_KEY: &str = "test-funk-key-01";

    async fn expect_auths_and_accept(server: &UdpSocket) -> SocketAddr {
        let mut buf = [0u8; 2048];
        let mut client = None;
        for _ in 0..2 {
            let (len, src) = server.recv_from(&mut buf).await.unwrap();
            let packet = Packet::from_bytes(&buf[..len]).unwrap();
            assert_eq!(packet.packet_type, PacketType::Auth);
            assert_eq!(packet.payload_str(), Some(TEST_KEY));
            server
                .send_to(
                    &Packet::auth_ok(packet.channel, packet.user).to_bytes(),
                    src,
                )
                .await
                .unwrap();
            client = Some(src);
        }
        client.unwrap()
    }

    async fn wait_for_state(
        events: &mut mpsc::Receiver<SessionEvent>,
        wanted: SessionState,
    ) -> bool {
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(SessionEvent::StateChanged(state))) if state == wanted => return true,
                Ok(Some(_)) => continue,
                _ => return false,
            }
        }
    }

    fn test_config(server_addr: SocketAddr) -> SessionConfig {
        SessionConfig {
            server_addr,
            primary_channel: 52,
            user_id: 1,
            funk_key: TEST_KEY.into(),
        }
    }

    #[tokio::test]
    async fn backoff_sequence_is_exact() {
        let delays: Vec<u64> = (0..8).map(|n| backoff_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[tokio::test]
    async fn connects_after_dual_auth_ok() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle = spawn(test_config(server.local_addr().unwrap()), event_tx);

        // Both channels (primary 52 and the common 41) must AUTH.
        let mut buf = [0u8; 2048];
        let mut channels = Vec::new();
        for _ in 0..2 {
            let (len, src) = server.recv_from(&mut buf).await.unwrap();
            let packet = Packet::from_bytes(&buf[..len]).unwrap();
            channels.push(packet.channel);
            server
                .send_to(
                    &Packet::auth_ok(packet.channel, packet.user).to_bytes(),
                    src,
                )
                .await
                .unwrap();
        }
        channels.sort();
        assert_eq!(channels, vec![EMERGENCY_CHANNEL, 52]);

        assert!(wait_for_state(&mut event_rx, SessionState::Connected).await);
        handle.disconnect().await;
        handle.join().await;
    }

    #[tokio::test]
    async fn audio_frames_carry_increasing_sequence() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle = spawn(test_config(server.local_addr().unwrap()), event_tx);

        expect_auths_and_accept(&server).await;
        assert!(wait_for_state(&mut event_rx, SessionState::Connected).await);

        let commands = handle.commands();
        commands
            .send(SessionCommand::SendAudio(vec![1; 100]))
            .await
            .unwrap();
        commands
            .send(SessionCommand::SendAudio(vec![2; 100]))
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let mut sequences = Vec::new();
        while sequences.len() < 2 {
            let (len, _) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let packet = Packet::from_bytes(&buf[..len]).unwrap();
            if packet.packet_type == PacketType::Audio {
                assert_eq!(packet.channel, 52);
                sequences.push(packet.sequence);
            }
        }
        assert_eq!(sequences, vec![0, 1]);

        handle.disconnect().await;
        handle.join().await;
    }

    #[tokio::test]
    async fn auth_fail_surfaces_and_stops() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle = spawn(test_config(server.local_addr().unwrap()), event_tx);

        let mut buf = [0u8; 2048];
        let (len, src) = server.recv_from(&mut buf).await.unwrap();
        let packet = Packet::from_bytes(&buf[..len]).unwrap();
        server
            .send_to(
                &Packet::auth_fail(packet.channel, packet.user, "Invalid funk key").to_bytes(),
                src,
            )
            .await
            .unwrap();

        let mut got_reason = false;
        loop {
            match timeout(Duration::from_secs(5), event_rx.recv()).await {
                Ok(Some(SessionEvent::AuthFailed { reason })) => {
                    assert_eq!(reason, "Invalid funk key");
                    got_reason = true;
                }
                Ok(Some(SessionEvent::StateChanged(SessionState::Disconnected))) => break,
                Ok(Some(_)) => continue,
                _ => panic!("expected auth failure"),
            }
        }
        assert!(got_reason);
        handle.join().await;
    }

    #[tokio::test]
    async fn transmit_switch_requires_authenticated_channel() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let handle = spawn(test_config(server.local_addr().unwrap()), event_tx);

        expect_auths_and_accept(&server).await;
        assert!(wait_for_state(&mut event_rx, SessionState::Connected).await);

        let commands = handle.commands();
        // 60 was never authenticated; the switch is refused, frames stay
        // on the primary channel.
        commands
            .send(SessionCommand::SetTransmitChannel(60))
            .await
            .unwrap();
        commands
            .send(SessionCommand::SendAudio(vec![9; 32]))
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        loop {
            let (len, _) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let packet = Packet::from_bytes(&buf[..len]).unwrap();
            if packet.packet_type == PacketType::Audio {
                assert_eq!(packet.channel, 52);
                break;
            }
        }

        // The common channel was authenticated, so switching there works.
        commands
            .send(SessionCommand::SetTransmitChannel(EMERGENCY_CHANNEL))
            .await
            .unwrap();
        commands
            .send(SessionCommand::SendAudio(vec![9; 32]))
            .await
            .unwrap();

        loop {
            let (len, _) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let packet = Packet::from_bytes(&buf[..len]).unwrap();
            if packet.packet_type == PacketType::Audio {
                assert_eq!(packet.channel, EMERGENCY_CHANNEL);
                break;
            }
        }

        handle.disconnect().await;
        handle.join().await;
    }

    async fn bare_connection(events: mpsc::Sender<SessionEvent>) -> Connection {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server = socket.local_addr().unwrap();
        let now = Instant::now();
        Connection {
            socket,
            server,
            primary: 52,
            user: 1,
            funk_key: TEST_KEY.into(),
            transmit_channel: 52,
            sequence: 0,
            authed_channels: HashSet::new(),
            confirmed: false,
            last_received: now,
            ping_sent: None,
            started: now,
            quality: Arc::new(Mutex::new(ConnectionQuality::new())),
            events,
        }
    }

    #[tokio::test]
    async fn pong_records_round_trip() {
        let (event_tx, _event_rx) = mpsc::channel(16);
        let mut conn = bare_connection(event_tx).await;
        conn.ping_sent = Some(Instant::now() - Duration::from_millis(40));

        let mut attempts = 0;
        assert!(conn.on_packet(Packet::pong(52, 1), &mut attempts).await.is_none());

        let snapshot = conn.quality().snapshot();
        assert!(snapshot.latency_ms >= 40);
        assert!(conn.ping_sent.is_none());
    }

    #[tokio::test]
    async fn watchdog_declares_loss_after_ten_seconds() {
        let (event_tx, _event_rx) = mpsc::channel(16);
        let mut conn = bare_connection(event_tx).await;
        conn.confirmed = true;

        conn.last_received = Instant::now() - Duration::from_secs(8);
        assert!(conn.on_watchdog().is_none());

        conn.last_received = Instant::now() - LOST_AFTER;
        assert!(matches!(conn.on_watchdog(), Some(ConnectionEnd::Lost)));
        assert_eq!(conn.quality().snapshot().signal_strength, 0);
    }

    #[tokio::test]
    async fn auth_timeout_abandons_the_attempt() {
        let (event_tx, _event_rx) = mpsc::channel(16);
        let mut conn = bare_connection(event_tx).await;
        conn.started = Instant::now() - AUTH_TIMEOUT - Duration::from_secs(1);
        // Packets are flowing but AUTH_OK never came.
        conn.last_received = Instant::now();
        assert!(matches!(conn.on_watchdog(), Some(ConnectionEnd::Lost)));
    }

    #[tokio::test]
    async fn dual_auth_confirmation_requires_both_channels() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let mut conn = bare_connection(event_tx).await;
        let mut attempts = 3;

        conn.on_packet(Packet::auth_ok(52, 1), &mut attempts).await;
        assert!(!conn.confirmed);
        assert_eq!(attempts, 0);

        conn.on_packet(Packet::auth_ok(EMERGENCY_CHANNEL, 1), &mut attempts)
            .await;
        assert!(conn.confirmed);

        let mut got_connected = false;
        while let Ok(event) = event_rx.try_recv() {
            if matches!(event, SessionEvent::StateChanged(SessionState::Connected)) {
                got_connected = true;
            }
        }
        assert!(got_connected);
    }
}
