use std::time::Duration;

/// Resubmission schedule: a fixed first delay, then doubling, capped.
#[derive(Debug, Clone)]
pub struct ResyncBackoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl ResyncBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
