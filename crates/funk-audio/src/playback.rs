use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use tracing::{error, info, warn};

use funk_protocol::packet::SAMPLE_RATE;

use crate::device;
use crate::playout::PlayoutPipeline;

/// Handle to an active speaker stream.
pub struct PlaybackStream {
    #[allow(dead_code)] // held to keep the stream alive
    stream: cpal::Stream,
    sample_rate: u32,
}

/// Start playback through the named device (or the default one), rendering
/// blocks from the shared playout pipeline inside the device callback.
pub fn start_playback(
    device_name: Option<&str>,
    playout: Arc<Mutex<PlayoutPipeline>>,
) -> Result<PlaybackStream> {
    let device = device::get_output_device(device_name)?;
    let default_config = device.default_output_config()?;
    let channels = default_config.channels() as usize;

    let preferred = StreamConfig {
        channels: default_config.channels(),
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let supports_preferred = default_config.sample_rate().0 == SAMPLE_RATE
        || device
            .build_output_stream(
                &preferred,
                |_: &mut [f32], _: &cpal::OutputCallbackInfo| {},
                |_| {},
                None,
            )
            .is_ok();

    let (config, actual_rate) = if supports_preferred {
        (preferred, SAMPLE_RATE)
    } else {
        let fallback_rate = default_config.sample_rate().0;
        warn!(
            "device does not support {} Hz, playing at {} Hz",
            SAMPLE_RATE, fallback_rate
        );
        (
            StreamConfig {
                channels: default_config.channels(),
                sample_rate: default_config.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            },
            fallback_rate,
        )
    };

    info!(
        device = device.name().unwrap_or_default(),
        sample_rate = actual_rate,
        channels,
        "starting audio playback"
    );

    let stream = match default_config.sample_format() {
        SampleFormat::F32 => {
            let mut mono: Vec<f32> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    mono.resize(frames, 0.0);

                    {
                        let mut playout = playout.lock().unwrap_or_else(|poisoned| {
                            warn!("playout mutex poisoned, recovering");
                            poisoned.into_inner()
                        });
                        playout.render(&mut mono, Instant::now());
                    }

                    for (out_frame, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
                        for slot in out_frame.iter_mut() {
                            *slot = sample;
                        }
                    }
                },
                move |err| error!("audio playback error: {}", err),
                None,
            )?
        }
        format => anyhow::bail!("unsupported output sample format: {:?}", format),
    };

    stream.play()?;

    Ok(PlaybackStream {
        stream,
        sample_rate: actual_rate,
    })
}

// SAFETY: PlaybackStream only holds the cpal::Stream handle to keep the
// device running; no methods are called on it from other threads. cpal's
// !Send/!Sync markers are overly conservative for hold-only use.
unsafe impl Send for PlaybackStream {}
unsafe impl Sync for PlaybackStream {}

impl PlaybackStream {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
