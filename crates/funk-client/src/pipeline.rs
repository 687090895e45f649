//! Wiring between the audio device layer and the network session.
//!
//! The capture side runs on a blocking thread: it drains the microphone
//! ring in 20 ms frames, runs the send pipeline and hands encoded frames
//! to the session over its command channel. The playout side is driven by
//! the device callback inside funk-audio; this module only pushes
//! received frames into the shared playout pipeline.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ringbuf::traits::Consumer;
use tokio::sync::mpsc;
use tracing::{error, info};

use funk_audio::capture::start_capture;
use funk_audio::level::{amplitude_to_db, rms};
use funk_audio::playout::PlayoutPipeline;
use funk_audio::send::{FrameVerdict, SendPipeline};
use funk_protocol::packet::FRAME_SIZE;
use funk_protocol::types::{ChannelId, UserId};

use crate::session::SessionCommand;

/// Drives the microphone through the send pipeline while `running`.
///
/// The level meter (`level_db_x100`, dBFS × 100) updates on every frame,
/// transmitting or not, so the UI meter works while idle.
pub fn spawn_capture_pipeline(
    device: Option<String>,
    mut pipeline: SendPipeline,
    transmitting: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    commands: mpsc::Sender<SessionCommand>,
    level_db_x100: Arc<AtomicI32>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let (_capture, mut consumer) = match start_capture(device.as_deref()) {
            Ok(capture) => capture,
            Err(e) => {
                // The session keeps running without audio.
                error!("failed to start audio capture: {}", e);
                return;
            }
        };

        let mut frame = vec![0.0f32; FRAME_SIZE];
        let mut filled = 0usize;
        info!("capture pipeline started");

        while running.load(Ordering::Relaxed) {
            let read = consumer.pop_slice(&mut frame[filled..]);
            filled += read;
            if filled < FRAME_SIZE {
                // Not a full 20 ms frame yet.
                std::thread::sleep(std::time::Duration::from_millis(5));
                continue;
            }
            filled = 0;

            if !transmitting.load(Ordering::Relaxed) {
                let level = amplitude_to_db(rms(&frame));
                level_db_x100.store((level * 100.0) as i32, Ordering::Relaxed);
                continue;
            }

            let verdict = pipeline.process(&mut frame);
            level_db_x100.store((pipeline.level_db() * 100.0) as i32, Ordering::Relaxed);

            if let FrameVerdict::Send(payload) = verdict {
                if commands
                    .blocking_send(SessionCommand::SendAudio(payload))
                    .is_err()
                {
                    break;
                }
            }
        }

        info!("capture pipeline stopped");
    })
}

/// Push one received audio frame into the shared playout pipeline.
pub fn enqueue_received(
    playout: &Arc<Mutex<PlayoutPipeline>>,
    channel: ChannelId,
    user: UserId,
    payload: Vec<u8>,
) {
    let mut playout = playout.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("playout mutex poisoned, recovering");
        poisoned.into_inner()
    });
    playout.push((channel, user), payload, Instant::now());
}
