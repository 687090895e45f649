//! Receive-side playout: the adaptive frame queue, squelch tone and the
//! decode → filter → volume chain driven from the output device callback.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use funk_protocol::packet::SAMPLE_RATE;
use funk_protocol::types::{ChannelId, UserId};

use crate::decoder::Decoder;
use crate::filter::BandPass;

/// Hard capacity of the playout queue, in frames.
pub const QUEUE_CAPACITY: usize = 20;

const MIN_DEPTH: usize = 3;
const MAX_DEPTH: usize = 20;
const INITIAL_DEPTH: usize = 3;

/// Minimum spacing between depth adjustments.
const ADJUST_INTERVAL: Duration = Duration::from_secs(5);

/// Silence gap after which the next frame counts as a new transmission
/// (re-arms buffering and the squelch tone).
const SESSION_GAP: Duration = Duration::from_secs(3);

/// Identifies a remote talker: (channel, user id from the packet header).
pub type SenderKey = (ChannelId, UserId);

/// Result of asking the queue for the next frame to play.
pub enum Dequeue {
    /// Still filling to the target depth; play silence.
    Buffering,
    /// A frame to play. `new_transmission` marks the first frame after a
    /// buffering period so the squelch tone can be blended in.
    Frame {
        sender: SenderKey,
        payload: Vec<u8>,
        new_transmission: bool,
    },
    /// Queue ran dry mid-stream; play silence.
    Underrun,
}

/// Adaptive playout queue.
///
/// Holds encoded frames from the network until the playback callback pulls
/// them. Starts playing once `depth` frames are queued; the depth adapts to
/// observed queue health at most every 5 s, within [3, 20].
pub struct AdaptiveQueue {
    frames: VecDeque<(SenderKey, Vec<u8>)>,
    depth: usize,
    buffering: bool,
    squelch_armed: bool,
    underruns: u64,
    last_adjust: Option<Instant>,
    last_push: Option<Instant>,
}

impl AdaptiveQueue {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::with_capacity(QUEUE_CAPACITY),
            depth: INITIAL_DEPTH,
            buffering: true,
            squelch_armed: false,
            underruns: 0,
            last_adjust: None,
            last_push: None,
        }
    }

    /// Enqueue a received frame. A full queue drops the oldest frame; a
    /// frame arriving after a long silence re-enters buffering.
    pub fn push(&mut self, sender: SenderKey, payload: Vec<u8>, now: Instant) {
        if let Some(last) = self.last_push {
            if self.frames.is_empty() && now.duration_since(last) >= SESSION_GAP {
                self.buffering = true;
            }
        }
        self.last_push = Some(now);

        if self.frames.len() == QUEUE_CAPACITY {
            self.frames.pop_front();
        }
        self.frames.push_back((sender, payload));
    }

    /// Pull the next frame at the playback cadence.
    pub fn pop(&mut self, now: Instant) -> Dequeue {
        if self.buffering {
            if self.frames.len() < self.depth {
                return Dequeue::Buffering;
            }
            self.buffering = false;
            self.squelch_armed = true;
        }

        match self.frames.pop_front() {
            Some((sender, payload)) => {
                self.adjust(now);
                Dequeue::Frame {
                    sender,
                    payload,
                    new_transmission: std::mem::take(&mut self.squelch_armed),
                }
            }
            None => {
                self.underruns += 1;
                Dequeue::Underrun
            }
        }
    }

    fn adjust(&mut self, now: Instant) {
        let last = *self.last_adjust.get_or_insert(now);
        if now.duration_since(last) < ADJUST_INTERVAL {
            return;
        }
        self.last_adjust = Some(now);

        let queued = self.frames.len();
        if queued <= 2 {
            self.depth = (self.depth + 2).min(MAX_DEPTH);
            debug!(depth = self.depth, "playout depth increased (queue low)");
        } else if queued >= QUEUE_CAPACITY - 2 {
            self.depth = self.depth.saturating_sub(1).max(MIN_DEPTH);
            debug!(depth = self.depth, "playout depth decreased (queue high)");
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Current target depth in frames.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }
}

impl Default for AdaptiveQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Blend the short decaying 1 kHz squelch tone over the start of a frame.
pub fn blend_squelch(frame: &mut [f32], sample_rate: u32) {
    for (n, sample) in frame.iter_mut().enumerate() {
        let t = n as f32 / sample_rate as f32;
        *sample += (2.0 * PI * 1_000.0 * t).sin() * 0.15 * (-t * 20.0).exp();
    }
}

/// Interpret a payload as raw little-endian i16 PCM.
pub fn pcm_from_bytes(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_767.0)
        .collect()
}

/// The complete receive chain: adaptive queue → per-talker Opus decode
/// (raw-PCM fallback) → squelch → band-pass → master volume.
pub struct PlayoutPipeline {
    queue: AdaptiveQueue,
    use_codec: bool,
    decoders: HashMap<SenderKey, Decoder>,
    filter: BandPass,
    volume: f32,
    decode_failures: u64,
}

impl PlayoutPipeline {
    pub fn new(use_codec: bool, volume: f32) -> Self {
        Self {
            queue: AdaptiveQueue::new(),
            use_codec,
            decoders: HashMap::new(),
            filter: BandPass::voice(SAMPLE_RATE),
            volume: volume.clamp(0.0, 1.0),
            decode_failures: 0,
        }
    }

    /// Hand a received audio payload to the queue.
    pub fn push(&mut self, sender: SenderKey, payload: Vec<u8>, now: Instant) {
        self.queue.push(sender, payload, now);
    }

    /// Render one output block. Fills `out` completely; silence while
    /// buffering or on underrun.
    pub fn render(&mut self, out: &mut [f32], now: Instant) {
        match self.queue.pop(now) {
            Dequeue::Buffering | Dequeue::Underrun => {
                out.fill(0.0);
            }
            Dequeue::Frame {
                sender,
                payload,
                new_transmission,
            } => {
                let mut samples = self.decode(sender, &payload);
                samples.resize(out.len(), 0.0);

                if new_transmission {
                    blend_squelch(&mut samples, SAMPLE_RATE);
                }

                self.filter.process_frame(&mut samples);

                for (slot, sample) in out.iter_mut().zip(samples.iter()) {
                    *slot = sample * self.volume;
                }
            }
        }
    }

    fn decode(&mut self, sender: SenderKey, payload: &[u8]) -> Vec<f32> {
        if self.use_codec {
            let decoder = match self.decoders.entry(sender) {
                std::collections::hash_map::Entry::Occupied(e) => Some(e.into_mut()),
                std::collections::hash_map::Entry::Vacant(slot) => match Decoder::new() {
                    Ok(d) => Some(slot.insert(d)),
                    Err(e) => {
                        warn!("decoder init failed: {}", e);
                        None
                    }
                },
            };

            if let Some(decoder) = decoder {
                match decoder.decode(payload) {
                    Ok(pcm) => return pcm,
                    Err(e) => {
                        self.decode_failures += 1;
                        debug!(?sender, "decode failed, treating frame as raw PCM: {}", e);
                    }
                }
            }
        }

        pcm_from_bytes(payload)
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn underruns(&self) -> u64 {
        self.queue.underruns()
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }
}
