//! Send-side frame pipeline: band-pass → level → AGC → soft clip →
//! quantize → voice activation → encode.
//!
//! Each captured 20 ms frame goes through `process` exactly once and yields
//! either a payload to transmit or a silent verdict; no stage panics or
//! throws past another.

use tracing::warn;

use funk_protocol::packet::SAMPLE_RATE;

use crate::agc::Agc;
use crate::encoder::Encoder;
use crate::filter::BandPass;
use crate::gate::NoiseGate;
use crate::level::{amplitude_to_db, rms};
use crate::vad::Vad;

/// What decides whether a frame is voice.
pub enum Activation {
    /// A voice-activity detector.
    Vad(Box<dyn Vad + Send>),
    /// A plain level gate.
    Gate(NoiseGate),
    /// Transmit every frame while recording.
    Always,
}

/// Outcome of processing one captured frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameVerdict {
    /// Encoded payload ready for transmission.
    Send(Vec<u8>),
    /// Gate closed or VAD judged the frame non-speech.
    Silent,
}

pub struct SendPipeline {
    filter: BandPass,
    agc: Option<Agc>,
    activation: Activation,
    encoder: Option<Encoder>,
    level_db: f32,
    encode_failures: u64,
}

impl SendPipeline {
    /// `use_codec = false` transmits raw PCM frames instead of Opus.
    pub fn new(activation: Activation, use_agc: bool, use_codec: bool) -> Self {
        let encoder = if use_codec {
            match Encoder::new() {
                Ok(encoder) => Some(encoder),
                Err(e) => {
                    warn!("Opus encoder init failed, using raw PCM: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            filter: BandPass::voice(SAMPLE_RATE),
            agc: use_agc.then(Agc::new),
            activation,
            encoder,
            level_db: crate::level::SILENCE_DB,
            encode_failures: 0,
        }
    }

    /// Run one captured frame through the pipeline.
    pub fn process(&mut self, frame: &mut [f32]) -> FrameVerdict {
        self.filter.process_frame(frame);

        self.level_db = amplitude_to_db(rms(frame));

        if let Some(agc) = &mut self.agc {
            agc.process(frame);
        }

        // Soft clip and quantize in one pass.
        let pcm: Vec<i16> = frame
            .iter()
            .map(|&s| ((s * 2.0).tanh() * 0.9 * 32_767.0) as i16)
            .collect();

        let voice = match &mut self.activation {
            Activation::Vad(vad) => vad.is_speech(&pcm, SAMPLE_RATE),
            Activation::Gate(gate) => gate.update(self.level_db),
            Activation::Always => true,
        };
        if !voice {
            return FrameVerdict::Silent;
        }

        match &mut self.encoder {
            Some(encoder) => match encoder.encode(&pcm) {
                Ok(payload) => FrameVerdict::Send(payload),
                Err(e) => {
                    self.encode_failures += 1;
                    warn!("Opus encode failed, sending frame as raw PCM: {}", e);
                    FrameVerdict::Send(pcm_to_bytes(&pcm))
                }
            },
            None => FrameVerdict::Send(pcm_to_bytes(&pcm)),
        }
    }

    /// Level of the most recent frame in dBFS, for the UI meter.
    pub fn level_db(&self) -> f32 {
        self.level_db
    }

    pub fn encode_failures(&self) -> u64 {
        self.encode_failures
    }

    /// Update the gate threshold; ignored for VAD and always-on modes.
    pub fn set_gate_threshold_db(&mut self, db: f32) {
        if let Activation::Gate(gate) = &mut self.activation {
            gate.set_threshold_db(db);
        }
    }
}

fn pcm_to_bytes(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::EnergyVad;
    use std::f32::consts::PI;

    const FRAME: usize = 960;

    fn tone(freq: f32, amplitude: f32) -> Vec<f32> {
        (0..FRAME)
            .map(|n| (2.0 * PI * freq * n as f32 / 48_000.0).sin() * amplitude)
            .collect()
    }

    #[test]
    fn always_on_raw_sends_full_frames() {
        let mut pipeline = SendPipeline::new(Activation::Always, false, false);
        let mut frame = tone(1_000.0, 0.5);

        match pipeline.process(&mut frame) {
            FrameVerdict::Send(payload) => assert_eq!(payload.len(), FRAME * 2),
            FrameVerdict::Silent => panic!("always-on must send"),
        }
    }

    #[test]
    fn gate_blocks_silence_and_passes_voice() {
        let gate = NoiseGate::new(-40.0, 20);
        let mut pipeline = SendPipeline::new(Activation::Gate(gate), false, false);

        let mut silence = vec![0.0f32; FRAME];
        assert_eq!(pipeline.process(&mut silence), FrameVerdict::Silent);

        let mut voice = tone(1_000.0, 0.5);
        assert!(matches!(pipeline.process(&mut voice), FrameVerdict::Send(_)));
    }

    #[test]
    fn gate_hold_keeps_transmitting_briefly() {
        let gate = NoiseGate::new(-40.0, 20);
        let mut pipeline = SendPipeline::new(Activation::Gate(gate), false, false);

        let mut voice = tone(1_000.0, 0.5);
        pipeline.process(&mut voice);

        // 200 ms hold = 10 silent frames still transmitted
        for _ in 0..10 {
            let mut silence = vec![0.0f32; FRAME];
            assert!(matches!(pipeline.process(&mut silence), FrameVerdict::Send(_)));
        }
        let mut silence = vec![0.0f32; FRAME];
        assert_eq!(pipeline.process(&mut silence), FrameVerdict::Silent);
    }

    #[test]
    fn vad_mode_blocks_silence() {
        let vad = Box::new(EnergyVad::new(2));
        let mut pipeline = SendPipeline::new(Activation::Vad(vad), false, false);

        let mut silence = vec![0.0f32; FRAME];
        assert_eq!(pipeline.process(&mut silence), FrameVerdict::Silent);

        let mut voice = tone(1_000.0, 0.5);
        assert!(matches!(pipeline.process(&mut voice), FrameVerdict::Send(_)));
    }

    #[test]
    fn level_meter_tracks_input() {
        let mut pipeline = SendPipeline::new(Activation::Always, false, false);

        let mut quiet = tone(1_000.0, 0.01);
        pipeline.process(&mut quiet);
        let quiet_db = pipeline.level_db();

        let mut loud = tone(1_000.0, 0.5);
        pipeline.process(&mut loud);
        assert!(pipeline.level_db() > quiet_db);
    }

    #[test]
    fn soft_clip_bounds_output() {
        let mut pipeline = SendPipeline::new(Activation::Always, false, false);
        let mut hot = tone(1_000.0, 4.0);

        match pipeline.process(&mut hot) {
            FrameVerdict::Send(payload) => {
                let samples = crate::playout::pcm_from_bytes(&payload);
                // tanh(2x)·0.9 keeps everything inside ±0.9
                assert!(samples.iter().all(|s| s.abs() <= 0.91));
            }
            FrameVerdict::Silent => panic!("expected frame"),
        }
    }

    #[test]
    fn raw_frames_roundtrip_through_playout_conversion() {
        let mut pipeline = SendPipeline::new(Activation::Always, false, false);
        let mut frame = tone(500.0, 0.2);

        let FrameVerdict::Send(payload) = pipeline.process(&mut frame) else {
            panic!("expected frame");
        };
        let decoded = crate::playout::pcm_from_bytes(&payload);
        assert_eq!(decoded.len(), FRAME);
    }
}
