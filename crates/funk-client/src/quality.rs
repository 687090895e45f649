//! Connection quality tracking: the rolling RTT window, derived jitter
//! and loss figures, and the 0–100 signal strength.

use std::collections::VecDeque;
use std::time::Duration;

/// RTT samples kept for jitter computation.
const WINDOW: usize = 10;

/// Signal strength classified for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrengthLabel {
    Excellent,
    Good,
    Fair,
    Weak,
    VeryWeak,
}

#[derive(Debug, Clone)]
pub struct QualitySnapshot {
    pub latency_ms: u32,
    pub jitter_ms: u32,
    pub loss_rate: f32,
    pub signal_strength: u8,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub label: StrengthLabel,
}

#[derive(Debug)]
pub struct ConnectionQuality {
    latencies: VecDeque<u32>,
    latency_ms: u32,
    jitter_ms: u32,
    packets_sent: u64,
    packets_received: u64,
    loss_rate: f32,
    signal: i32,
}

impl ConnectionQuality {
    pub fn new() -> Self {
        Self {
            latencies: VecDeque::with_capacity(WINDOW),
            latency_ms: 0,
            jitter_ms: 0,
            packets_sent: 0,
            packets_received: 0,
            loss_rate: 0.0,
            signal: 100,
        }
    }

    pub fn on_sent(&mut self) {
        self.packets_sent += 1;
    }

    pub fn on_received(&mut self) {
        self.packets_received += 1;
    }

    pub fn on_send_error(&mut self) {
        self.bump(-10);
    }

    /// Record a PING→PONG round trip.
    pub fn record_rtt(&mut self, rtt: Duration) {
        let ms = rtt.as_millis().min(u128::from(u32::MAX)) as u32;
        self.latency_ms = ms;

        if self.latencies.len() == WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(ms);

        if self.latencies.len() >= 2 {
            let diffs: u32 = self
                .latencies
                .iter()
                .zip(self.latencies.iter().skip(1))
                .map(|(a, b)| a.abs_diff(*b))
                .sum();
            self.jitter_ms = diffs / (self.latencies.len() as u32 - 1);
        }

        if ms < 50 {
            self.bump(2);
        } else if ms > 200 {
            self.bump(-5);
        }
    }

    /// Recompute the loss rate from the send/receive counters.
    pub fn update_loss(&mut self) {
        if self.packets_sent > 0 {
            let ratio = self.packets_received as f32 / self.packets_sent as f32;
            self.loss_rate = (1.0 - ratio).max(0.0);
        }
        if self.loss_rate > 0.10 {
            self.bump(-15);
        } else if self.loss_rate < 0.01 {
            self.bump(3);
        }
    }

    /// Feed the watchdog's view of how long the link has been silent.
    pub fn observe_age(&mut self, age: Duration) {
        if age < Duration::from_secs(2) {
            self.bump(5);
        } else if age > Duration::from_secs(5) {
            self.bump(-10);
        }
        if age >= Duration::from_secs(10) {
            self.signal = 0;
        }
    }

    /// Full strength on a fresh AUTH_OK.
    pub fn reset_signal(&mut self) {
        self.signal = 100;
    }

    fn bump(&mut self, delta: i32) {
        self.signal = (self.signal + delta).clamp(0, 100);
    }

    pub fn signal_strength(&self) -> u8 {
        self.signal as u8
    }

    pub fn label(&self) -> StrengthLabel {
        match self.signal {
            s if s >= 80 => StrengthLabel::Excellent,
            s if s >= 60 => StrengthLabel::Good,
            s if s >= 40 => StrengthLabel::Fair,
            s if s >= 20 => StrengthLabel::Weak,
            _ => StrengthLabel::VeryWeak,
        }
    }

    pub fn snapshot(&self) -> QualitySnapshot {
        QualitySnapshot {
            latency_ms: self.latency_ms,
            jitter_ms: self.jitter_ms,
            loss_rate: self.loss_rate,
            signal_strength: self.signal_strength(),
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            label: self.label(),
        }
    }
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_full_strength() {
        let quality = ConnectionQuality::new();
        assert_eq!(quality.signal_strength(), 100);
        assert_eq!(quality.label(), StrengthLabel::Excellent);
    }

    #[test]
    fn jitter_is_mean_absolute_successive_difference() {
        let mut quality = ConnectionQuality::new();
        for ms in [10u64, 20, 10, 20] {
            quality.record_rtt(Duration::from_millis(ms));
        }
        // |20-10| + |10-20| + |20-10| over 3 pairs = 10
        assert_eq!(quality.snapshot().jitter_ms, 10);
    }

    #[test]
    fn window_is_bounded_to_ten() {
        let mut quality = ConnectionQuality::new();
        for ms in 0..50u64 {
            quality.record_rtt(Duration::from_millis(ms));
        }
        assert!(quality.latencies.len() <= 10);
    }

    #[test]
    fn fast_rtt_raises_signal_slow_rtt_lowers_it() {
        let mut quality = ConnectionQuality::new();
        quality.signal = 50;
        quality.record_rtt(Duration::from_millis(10));
        assert_eq!(quality.signal_strength(), 52);

        quality.record_rtt(Duration::from_millis(300));
        assert_eq!(quality.signal_strength(), 47);
    }

    #[test]
    fn signal_is_always_clamped() {
        let mut quality = ConnectionQuality::new();
        for _ in 0..100 {
            quality.record_rtt(Duration::from_millis(1));
        }
        assert_eq!(quality.signal_strength(), 100);

        for _ in 0..100 {
            quality.record_rtt(Duration::from_millis(500));
        }
        assert_eq!(quality.signal_strength(), 0);
    }

    #[test]
    fn loss_rate_tracks_counters() {
        let mut quality = ConnectionQuality::new();
        for _ in 0..10 {
            quality.on_sent();
        }
        for _ in 0..8 {
            quality.on_received();
        }
        quality.update_loss();
        assert!((quality.snapshot().loss_rate - 0.2).abs() < 1e-6);
        // 20% loss costs 15 points
        assert_eq!(quality.signal_strength(), 85);
    }

    #[test]
    fn clean_link_recovers_signal() {
        let mut quality = ConnectionQuality::new();
        quality.signal = 50;
        for _ in 0..5 {
            quality.on_sent();
            quality.on_received();
        }
        quality.update_loss();
        assert_eq!(quality.signal_strength(), 53);
    }

    #[test]
    fn silence_ages_degrade_signal() {
        let mut quality = ConnectionQuality::new();
        quality.observe_age(Duration::from_secs(1));
        assert_eq!(quality.signal_strength(), 100);

        quality.signal = 80;
        quality.observe_age(Duration::from_secs(6));
        assert_eq!(quality.signal_strength(), 70);

        quality.observe_age(Duration::from_secs(10));
        assert_eq!(quality.signal_strength(), 0);
    }

    #[test]
    fn labels_follow_thresholds() {
        let mut quality = ConnectionQuality::new();
        for (signal, label) in [
            (85, StrengthLabel::Excellent),
            (80, StrengthLabel::Excellent),
            (60, StrengthLabel::Good),
            (40, StrengthLabel::Fair),
            (20, StrengthLabel::Weak),
            (19, StrengthLabel::VeryWeak),
        ] {
            quality.signal = signal;
            assert_eq!(quality.label(), label);
        }
    }
}
