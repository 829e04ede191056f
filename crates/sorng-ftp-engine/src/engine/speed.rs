//! Transfer speed over a sliding window of one-second buckets.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_WINDOW_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct TransferSpeedMeter {
    started: Instant,
    window: u64,
    /// (second since start, bytes) with the newest at the back.
    buckets: VecDeque<(u64, u64)>,
    total: u64,
}

impl Default for TransferSpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferSpeedMeter {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW_SECS)
    }

    pub fn with_window(window_secs: u64) -> Self {
        Self {
            started: Instant::now(),
            window: window_secs.max(1),
            buckets: VecDeque::new(),
            total: 0,
        }
    }

    fn now_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    fn expire(&mut self, now: u64) {
        while let Some(&(sec, _)) = self.buckets.front() {
            if sec + self.window <= now {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn add(&mut self, bytes: u64) {
        let now = self.now_secs();
        self.total += bytes;
        match self.buckets.back_mut() {
            Some((sec, sum)) if *sec == now => *sum += bytes,
            _ => self.buckets.push_back((now, bytes)),
        }
        self.expire(now);
    }

    /// Bytes per second over the window (or the elapsed time if shorter).
    pub fn speed(&mut self) -> u64 {
        let now = self.now_secs();
        self.expire(now);
        let sum: u64 = self.buckets.iter().map(|(_, b)| b).sum();
        let span = (now + 1).min(self.window);
        sum / span
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_speed_window() {
        let mut meter = TransferSpeedMeter::with_window(2);
        meter.add(1000);
        assert_eq!(meter.speed(), 1000);
        tokio::time::advance(Duration::from_secs(1)).await;
        meter.add(3000);
        assert_eq!(meter.speed(), 2000);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(meter.speed(), 0);
        assert_eq!(meter.total(), 4000);
    }
}
