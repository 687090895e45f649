use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

mod api;
mod hotkeys;
mod pipeline;
mod ptt;
mod quality;
mod session;
mod settings;

use funk_audio::gate::NoiseGate;
use funk_audio::playout::PlayoutPipeline;
use funk_audio::send::{Activation, SendPipeline};
use funk_audio::vad::EnergyVad;
use funk_protocol::types::{is_valid_primary, EMERGENCY_CHANNEL};

use api::ApiClient;
use hotkeys::{parse_binding, HotkeyRouter};
use ptt::{PttController, SoundCue};
use session::{SessionCommand, SessionConfig, SessionEvent, SessionState};
use settings::Settings;

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "funk-client", about = "Funk push-to-talk client")]
struct Args {
    /// Path to the settings file (JSON)
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Relay host, overrides settings
    #[arg(long)]
    server: Option<String>,

    /// Relay port, overrides settings
    #[arg(long)]
    port: Option<u16>,

    /// Primary channel, overrides settings
    #[arg(long)]
    channel: Option<u8>,

    /// Funk key, overrides settings
    #[arg(long)]
    funk_key: Option<String>,

    /// List audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funk_client=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.list_devices {
        return list_devices();
    }

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(settings::default_settings_path);
    let mut cfg = settings::load(&settings_path);

    if let Some(server) = args.server {
        cfg.server_ip = server;
    }
    if let Some(port) = args.port {
        cfg.server_port = port;
    }
    if let Some(channel) = args.channel {
        cfg.channel = channel;
    }
    if let Some(funk_key) = args.funk_key {
        cfg.funk_key = Some(funk_key);
    }

    if !is_valid_primary(cfg.channel) {
        bail!(
            "channel {} cannot be used as primary (channel {} is the common channel)",
            cfg.channel,
            EMERGENCY_CHANNEL
        );
    }
    let Some(funk_key) = cfg.funk_key.clone() else {
        bail!("no funk key configured; set funk_key in {}", settings_path.display());
    };

    info!(version = APP_VERSION, "funk client starting");

    bootstrap(&cfg, &funk_key).await;

    let server_addr = tokio::net::lookup_host((cfg.server_ip.as_str(), cfg.server_port))
        .await
        .with_context(|| format!("cannot resolve {}:{}", cfg.server_ip, cfg.server_port))?
        .next()
        .with_context(|| format!("no addresses for {}", cfg.server_ip))?;

    // Session
    let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(256);
    let handle = session::spawn(
        SessionConfig {
            server_addr,
            primary_channel: cfg.channel,
            user_id: 1,
            funk_key,
        },
        event_tx,
    );

    // Playout (shared with the output device callback)
    let playout = Arc::new(Mutex::new(PlayoutPipeline::new(
        cfg.codec == "opus",
        cfg.speaker_volume,
    )));
    let playback = match funk_audio::playback::start_playback(
        cfg.speaker_device.as_deref(),
        playout.clone(),
    ) {
        Ok(stream) => Some(stream),
        Err(e) => {
            // Stay connected; the operator still transmits.
            error!("failed to start audio playback: {}", e);
            None
        }
    };

    // PTT and hotkeys
    let (cue_tx, mut cue_rx) = mpsc::channel::<SoundCue>(16);
    let mut ptt = PttController::new(
        handle.commands(),
        cue_tx,
        cfg.channel,
        cfg.channel1_target,
        cfg.channel2_target,
    );
    let transmitting = ptt.transmitting();

    let (hotkey_tx, mut hotkey_rx) = mpsc::channel(64);
    let primary_binding = parse_binding(&cfg.hotkey_primary)
        .with_context(|| format!("invalid hotkey_primary: {}", cfg.hotkey_primary))?;
    let secondary_binding = parse_binding(&cfg.hotkey_secondary)
        .with_context(|| format!("invalid hotkey_secondary: {}", cfg.hotkey_secondary))?;
    let router = HotkeyRouter::new(
        primary_binding,
        secondary_binding,
        cfg.hotkey_channel1.as_deref().and_then(parse_binding),
        cfg.hotkey_channel2.as_deref().and_then(parse_binding),
    );
    hotkeys::spawn_listener(router, hotkey_tx);

    // Capture
    let running = Arc::new(AtomicBool::new(true));
    let level_db_x100 = Arc::new(AtomicI32::new(-9_600));
    let activation = if cfg.vad_enabled {
        Activation::Vad(Box::new(EnergyVad::new(cfg.vad_aggressiveness.min(3))))
    } else if cfg.noise_gate_enabled {
        Activation::Gate(NoiseGate::new(cfg.noise_gate_threshold, 20))
    } else {
        Activation::Always
    };
    let send_pipeline = SendPipeline::new(activation, cfg.agc_enabled, cfg.codec == "opus");
    let capture_task = pipeline::spawn_capture_pipeline(
        cfg.mic_device.clone(),
        send_pipeline,
        transmitting,
        running.clone(),
        handle.commands(),
        level_db_x100,
    );

    if settings::save(&settings_path, &cfg).is_err() {
        warn!("could not persist settings to {}", settings_path.display());
    }

    // Event pump; stdin doubles as the minimal control surface
    // (`channel <n>`, `quality`, `quit`).
    let sounds_enabled = cfg.sounds_enabled;
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdin_lines = tokio::io::AsyncBufReadExt::lines(stdin);
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    None => break,
                    Some(SessionEvent::StateChanged(state)) => {
                        info!(?state, "session state");
                        if state == SessionState::Disconnected {
                            break;
                        }
                    }
                    Some(SessionEvent::AuthFailed { reason }) => {
                        error!(%reason, "authentication rejected by server");
                    }
                    Some(SessionEvent::Audio { channel, user, payload }) => {
                        pipeline::enqueue_received(&playout, channel, user, payload);
                    }
                    Some(SessionEvent::Quality(snapshot)) => {
                        debug!(
                            latency_ms = snapshot.latency_ms,
                            jitter_ms = snapshot.jitter_ms,
                            signal = snapshot.signal_strength,
                            label = ?snapshot.label,
                            "connection quality"
                        );
                    }
                }
            }

            cue = cue_rx.recv() => {
                if let Some(cue) = cue {
                    if sounds_enabled {
                        // Effect playback lives outside the core; the cue is
                        // what the relay timing depends on.
                        debug!(?cue, "sound cue");
                    }
                }
            }

            routed = hotkey_rx.recv() => {
                if let Some(event) = routed {
                    ptt.handle(event).await;
                    debug!(channel = ptt.current_channel(), "transmit channel");
                }
            }

            line = stdin_lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        handle_console_command(
                            line.trim(),
                            &handle,
                            &mut ptt,
                            &mut cfg,
                            &settings_path,
                        )
                        .await;
                    }
                    // stdin closed (e.g. running detached): stop polling it.
                    _ => stdin_open = false,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                handle.disconnect().await;
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    let _ = capture_task.await;
    drop(playback);
    handle.join().await;

    Ok(())
}

/// Console commands: the settings surface of the headless client.
async fn handle_console_command(
    line: &str,
    handle: &session::SessionHandle,
    ptt: &mut PttController,
    cfg: &mut Settings,
    settings_path: &PathBuf,
) {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("channel") => {
            let Some(channel) = parts.next().and_then(|s| s.parse::<u8>().ok()) else {
                println!("usage: channel <id>");
                return;
            };
            if !is_valid_primary(channel) {
                println!(
                    "channel {} cannot be a primary channel ({} is the common channel)",
                    channel, EMERGENCY_CHANNEL
                );
                return;
            }
            let _ = handle
                .commands()
                .send(SessionCommand::SetChannel(channel))
                .await;
            ptt.set_primary(channel);
            cfg.channel = channel;
            if let Err(e) = settings::save(settings_path, cfg) {
                warn!("could not persist settings: {}", e);
            }
            println!("primary channel set to {}", channel);
        }
        Some("quality") => {
            let q = handle.quality();
            println!(
                "latency {} ms, jitter {} ms, loss {:.1}%, signal {} ({:?}), sent {}, received {}",
                q.latency_ms,
                q.jitter_ms,
                q.loss_rate * 100.0,
                q.signal_strength,
                q.label,
                q.packets_sent,
                q.packets_received
            );
        }
        Some("quit") | Some("exit") => {
            handle.disconnect().await;
        }
        Some(other) => println!("unknown command: {} (channel <id> | quality | quit)", other),
        None => {}
    }
}

/// Fetch the channel plan and the advertised version before connecting.
async fn bootstrap(cfg: &Settings, funk_key: &str) {
    let api = ApiClient::new(&cfg.server_ip, cfg.api_port);

    let allowed = api.allowed_channels(funk_key).await;
    if !allowed.contains(&cfg.channel) {
        warn!(
            channel = cfg.channel,
            "configured channel is not in the allowed list; the server will refuse it"
        );
    }

    if let Some(version) = api.version().await {
        if version.version != APP_VERSION {
            info!(
                available = %version.version,
                running = APP_VERSION,
                "a different client version is advertised"
            );
            if !version.changelog.is_empty() {
                info!(changelog = %version.changelog, "changelog");
            }
        }
    }
}

fn list_devices() -> Result<()> {
    println!("Input devices:");
    for device in funk_audio::device::list_input_devices()? {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("  {}{}", device.name, marker);
    }
    println!("Output devices:");
    for device in funk_audio::device::list_output_devices()? {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("  {}{}", device.name, marker);
    }
    Ok(())
}
