//! Per-(channel, sender) jitter buffer.
//!
//! Reorders the sender's 16-bit sequence stream before fan-out. A packet
//! waits at most [`MAX_AGE`] before being force-released; the buffer holds
//! at most twice [`TARGET_BUFFER`] packets. "Older" is decided by insertion
//! time, not sequence number, because sequence is ambiguous near the
//! wraparound boundary.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Packets to aim for in the buffer (~100 ms at 20 ms per packet).
pub const TARGET_BUFFER: usize = 5;

/// Maximum time a packet may sit before forced release.
pub const MAX_AGE: Duration = Duration::from_millis(200);

/// True when `a` is behind `b` on the 16-bit sequence circle.
fn seq_before(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000
}

pub struct JitterBuffer {
    buffer: HashMap<u16, (Vec<u8>, Instant)>,
    next_seq: Option<u16>,
}

impl JitterBuffer {
    pub fn new() -> Self {
        Self {
            buffer: HashMap::new(),
            next_seq: None,
        }
    }

    /// Insert a packet and return everything releasable, in order.
    ///
    /// The release pass also force-releases expired packets (jumping the
    /// expected sequence past the gap) and trims overflow.
    pub fn insert(&mut self, sequence: u16, data: Vec<u8>, now: Instant) -> Vec<Vec<u8>> {
        if self.next_seq.is_none() {
            self.next_seq = Some(sequence);
        }

        // Packets behind the cursor were already played past; dropping
        // them keeps next-expected monotonic.
        if let Some(next) = self.next_seq {
            if seq_before(sequence, next) {
                return Vec::new();
            }
        }

        self.buffer.insert(sequence, (data, now));

        let mut ready = Vec::new();
        self.release_in_order(&mut ready);
        self.release_expired(now, &mut ready);
        self.trim_overflow(&mut ready);
        ready
    }

    fn release_in_order(&mut self, ready: &mut Vec<Vec<u8>>) {
        while let Some(next) = self.next_seq {
            match self.buffer.remove(&next) {
                Some((data, _)) => {
                    ready.push(data);
                    self.next_seq = Some(next.wrapping_add(1));
                }
                None => break,
            }
        }
    }

    fn release_expired(&mut self, now: Instant, ready: &mut Vec<Vec<u8>>) {
        let mut expired: Vec<u16> = self
            .buffer
            .iter()
            .filter(|(_, (_, inserted))| now.duration_since(*inserted) >= MAX_AGE)
            .map(|(&seq, _)| seq)
            .collect();
        if expired.is_empty() {
            return;
        }

        expired.sort_unstable();
        for &seq in &expired {
            if let Some((data, _)) = self.buffer.remove(&seq) {
                ready.push(data);
            }
        }

        // Accept a permanent gap: jump past the released packets, then see
        // whether buffered successors are now in order.
        if let Some(&highest) = expired.last() {
            self.next_seq = Some(highest.wrapping_add(1));
        }
        self.release_in_order(ready);
    }

    fn trim_overflow(&mut self, ready: &mut Vec<Vec<u8>>) {
        if self.buffer.len() <= TARGET_BUFFER * 2 {
            return;
        }

        let mut by_age: Vec<(u16, Instant)> = self
            .buffer
            .iter()
            .map(|(&seq, (_, inserted))| (seq, *inserted))
            .collect();
        by_age.sort_by_key(|&(_, inserted)| inserted);

        let excess = self.buffer.len() - TARGET_BUFFER;
        let mut victims: Vec<u16> = by_age[..excess].iter().map(|&(seq, _)| seq).collect();
        victims.sort_unstable();

        tracing::warn!(released = excess, "jitter buffer overflow");
        for &seq in &victims {
            if let Some((data, _)) = self.buffer.remove(&seq) {
                ready.push(data);
            }
        }
        if let Some(&highest) = victims.last() {
            if let Some(next) = self.next_seq {
                if seq_before(next, highest.wrapping_add(1)) {
                    self.next_seq = Some(highest.wrapping_add(1));
                }
            }
        }
    }

    /// Number of packets currently held out of order.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}
