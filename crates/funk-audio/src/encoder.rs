use anyhow::Result;
use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Channels, SampleRate, Signal};
use funk_protocol::packet::{FRAME_SIZE, OPUS_BITRATE};

/// Wraps the Opus encoder with the settings used for funk voice.
pub struct Encoder {
    inner: OpusEncoder,
}

impl Encoder {
    /// Create an encoder configured for narrow voice traffic: mono 48 kHz,
    /// 24 kbps, inband FEC against the expected datagram loss.
    pub fn new() -> Result<Self> {
        let mut encoder =
            OpusEncoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip)?;

        encoder.set_bitrate(audiopus::Bitrate::BitsPerSecond(OPUS_BITRATE))?;
        encoder.set_inband_fec(true)?;
        encoder.set_packet_loss_perc(15)?;
        encoder.set_signal(Signal::Voice)?;

        Ok(Self { inner: encoder })
    }

    /// Encode one 20 ms frame of i16 PCM into Opus.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        debug_assert_eq!(pcm.len(), FRAME_SIZE);

        let mut output = vec![0u8; 512];
        let len = self.inner.encode(pcm, &mut output)?;
        output.truncate(len);
        Ok(output)
    }
}
