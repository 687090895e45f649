use anyhow::Result;
use audiopus::coder::Decoder as OpusDecoder;
use audiopus::packet::Packet;
use audiopus::{Channels, MutSignals, SampleRate};
use funk_protocol::packet::FRAME_SIZE;

/// Wraps the Opus decoder. One instance per remote talker so loss
/// concealment state is not shared across streams.
pub struct Decoder {
    inner: OpusDecoder,
}

impl Decoder {
    pub fn new() -> Result<Self> {
        let decoder = OpusDecoder::new(SampleRate::Hz48000, Channels::Mono)?;
        Ok(Self { inner: decoder })
    }

    /// Decode an Opus payload into f32 samples (one 20 ms frame).
    pub fn decode(&mut self, opus_data: &[u8]) -> Result<Vec<f32>> {
        let mut output = vec![0.0f32; FRAME_SIZE];
        let packet = Packet::try_from(opus_data)?;
        let signals = MutSignals::try_from(&mut output)?;
        let samples = self.inner.decode_float(Some(packet), signals, false)?;
        output.truncate(samples);
        Ok(output)
    }

    /// Conceal a lost frame (Opus interpolates from decoder state).
    pub fn decode_lost(&mut self) -> Result<Vec<f32>> {
        let mut output = vec![0.0f32; FRAME_SIZE];
        let signals = MutSignals::try_from(&mut output)?;
        let samples = self.inner.decode_float(None, signals, false)?;
        output.truncate(samples);
        Ok(output)
    }
}
