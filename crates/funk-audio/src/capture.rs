use anyhow::Result;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use ringbuf::traits::{Producer, Split};
use ringbuf::HeapRb;
use tracing::{error, info, warn};

use funk_protocol::packet::SAMPLE_RATE;

use crate::device;

/// Handle to an active microphone stream.
///
/// Samples land in a lock-free ring buffer that the capture pipeline
/// thread drains in 20 ms frames.
pub struct CaptureStream {
    stream: cpal::Stream,
    sample_rate: u32,
}

/// Ring capacity in samples (~200 ms at 48 kHz).
const CAPTURE_BUFFER_SIZE: usize = SAMPLE_RATE as usize / 5;

/// Start capturing from the named device (or the default one).
///
/// Asks the device for 48 kHz so frames match the encoder without
/// resampling; falls back to the device default rate if 48 kHz is refused.
pub fn start_capture(device_name: Option<&str>) -> Result<(CaptureStream, ringbuf::HeapCons<f32>)> {
    let device = device::get_input_device(device_name)?;
    let default_config = device.default_input_config()?;
    let channels = default_config.channels() as usize;
    let sample_format = default_config.sample_format();

    let preferred = StreamConfig {
        channels: default_config.channels(),
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    // Probe 48 kHz support with a throwaway stream; some backends only
    // report the failure at build time.
    let supports_preferred = default_config.sample_rate().0 == SAMPLE_RATE
        || device
            .build_input_stream(&preferred, |_: &[f32], _: &cpal::InputCallbackInfo| {}, |_| {}, None)
            .is_ok();

    let (config, actual_rate) = if supports_preferred {
        (preferred, SAMPLE_RATE)
    } else {
        let fallback_rate = default_config.sample_rate().0;
        warn!(
            "device does not support {} Hz, capturing at {} Hz",
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
        "starting audio capture"
    );

    let rb = HeapRb::<f32>::new(CAPTURE_BUFFER_SIZE);
    let (mut producer, consumer) = rb.split();

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Multi-channel devices contribute only their first channel.
                if channels == 1 {
                    let _ = producer.push_slice(data);
                } else {
                    for frame in data.chunks(channels) {
                        let _ = producer.try_push(frame[0]);
                    }
                }
            },
            move |err| error!("audio capture error: {}", err),
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels) {
                    let _ = producer.try_push(frame[0] as f32 / i16::MAX as f32);
                }
            },
            move |err| error!("audio capture error: {}", err),
            None,
        )?,
        format => anyhow::bail!("unsupported capture sample format: {:?}", format),
    };

    stream.play()?;

    Ok((
        CaptureStream {
            stream,
            sample_rate: actual_rate,
        },
        consumer,
    ))
}

impl CaptureStream {
    /// The hardware sample rate the device actually runs at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Pause capture while PTT is released.
    pub fn pause(&self) -> Result<()> {
        self.stream.pause()?;
        Ok(())
    }

    /// Resume capture when PTT is pressed.
    pub fn resume(&self) -> Result<()> {
        self.stream.play()?;
        Ok(())
    }
}
