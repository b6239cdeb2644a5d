//! Time management utilities

use std::time::{Duration, Instant};

/// Simple stopwatch for measuring elapsed time
#[derive(Debug)]
pub struct Stopwatch {
    start_time: Option<Instant>,
    elapsed: Duration,
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Stopwatch {
    /// Create a new stopped stopwatch
    pub fn new() -> Self {
        Self {
            start_time: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Create a new stopwatch and start it immediately
    pub fn start_new() -> Self {
        let mut stopwatch = Self::new();
        stopwatch.start();
        stopwatch
    }

    /// Start the stopwatch
    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Reset the stopwatch to zero and leave it stopped
    pub fn reset(&mut self) {
        self.start_time = None;
        self.elapsed = Duration::ZERO;
    }

    /// Restart the stopwatch (reset and start)
    pub fn restart(&mut self) {
        self.reset();
        self.start();
    }

    /// Get the elapsed time
    pub fn elapsed(&self) -> Duration {
        let current_elapsed = self.start_time.map_or(Duration::ZERO, |start| start.elapsed());
        self.elapsed + current_elapsed
    }

    /// Check if the stopwatch is currently running
    pub fn is_running(&self) -> bool {
        self.start_time.is_some()
    }
}

/// Gates how often a capped-rate render target may advance
///
/// Independent of the main loop's own rate: the loop may spin as fast as it
/// likes, the gate only opens once per interval. Without a cap it is always
/// open.
#[derive(Debug)]
pub struct FrameRateGate {
    interval: Option<Duration>,
    stopwatch: Stopwatch,
}

impl FrameRateGate {
    /// Gate that opens at most `fps` times per second
    ///
    /// Non-positive or non-finite rates mean "uncapped".
    pub fn new(target_fps: Option<f32>) -> Self {
        let interval = target_fps
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .map(|fps| Duration::from_secs_f32(1.0 / fps));
        Self {
            interval,
            stopwatch: Stopwatch::new(),
        }
    }

    /// Gate that never blocks
    pub fn uncapped() -> Self {
        Self::new(None)
    }

    /// Minimum time between two open gates, if capped
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Returns true (and restarts the interval) when the target may render
    ///
    /// The first call on a fresh gate always succeeds.
    pub fn ready(&mut self) -> bool {
        let Some(interval) = self.interval else {
            return true;
        };

        if !self.stopwatch.is_running() || self.stopwatch.elapsed() >= interval {
            self.stopwatch.restart();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncapped_gate_always_open() {
        let mut gate = FrameRateGate::uncapped();
        assert!(gate.ready());
        assert!(gate.ready());
        assert!(gate.interval().is_none());
    }

    #[test]
    fn test_capped_gate_opens_once_per_interval() {
        let mut gate = FrameRateGate::new(Some(1.0));
        assert!(gate.ready());
        // The next opening is a full second away.
        assert!(!gate.ready());
        assert!(!gate.ready());
    }

    #[test]
    fn test_fast_gate_reopens() {
        let mut gate = FrameRateGate::new(Some(1000.0));
        assert!(gate.ready());
        std::thread::sleep(Duration::from_millis(5));
        assert!(gate.ready());
    }

    #[test]
    fn test_invalid_rate_is_uncapped() {
        assert!(FrameRateGate::new(Some(0.0)).interval().is_none());
        assert!(FrameRateGate::new(Some(f32::NAN)).interval().is_none());
    }

    #[test]
    fn test_stopwatch_restart() {
        let mut stopwatch = Stopwatch::start_new();
        assert!(stopwatch.is_running());
        stopwatch.reset();
        assert!(!stopwatch.is_running());
        assert_eq!(stopwatch.elapsed(), Duration::ZERO);
    }
}
