use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY_MILLIS: u64 = 60_000;
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_delay_millis: u64,
    pub backoff_factor: f64,
    pub max_delay_millis: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_millis: DEFAULT_INITIAL_DELAY_MILLIS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_millis: DEFAULT_MAX_DELAY_MILLIS,
        }
    }
}

/// Exponential backoff with +/-50% jitter and a hard cap.
///
/// Delay for attempt `n` is `initial * factor^n + jitter`, clamped to
/// `max_delay_millis`. `reset()` returns to the initial delay after a healthy
/// stream; `reset_to_max()` is used after RESOURCE_EXHAUSTED so the next
/// attempt waits the full cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
    forced_max: bool,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            forced_max: false,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.forced_max = false;
    }

    pub fn reset_to_max(&mut self) {
        self.forced_max = true;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        if self.forced_max {
            self.forced_max = false;
            return Duration::from_millis(self.config.max_delay_millis);
        }
        let base = (self.config.initial_delay_millis as f64)
            * self.config.backoff_factor.powi(self.attempt as i32);
        let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
        let millis = (base + jitter)
            .round()
            .clamp(0.0, self.config.max_delay_millis as f64);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(millis as u64)
    }
}
