use core::time::Duration;

/// Default target lifetime of one segment.
pub const DEFAULT_SEGMENT_TTL: Duration = Duration::from_secs(15 * 60);

/// Default upper bound for an adaptively grown step.
pub const DEFAULT_MAX_STEP: u32 = 1_000_000;

/// Adaptive step sizing.
///
/// After each refill the next step is chosen from how long the previous
/// segment lasted:
///
/// - shorter than `segment_ttl`: double, capped at `max_step`
/// - shorter than `2 * segment_ttl`: keep
/// - otherwise: halve, but never below the tag's configured step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPolicy {
    pub segment_ttl: Duration,
    pub max_step: u32,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            segment_ttl: DEFAULT_SEGMENT_TTL,
            max_step: DEFAULT_MAX_STEP,
        }
    }
}

impl StepPolicy {
    /// Chooses the step for the next fetch.
    ///
    /// `current` is the step used for the previous fetch, `configured` the
    /// tag's persisted step and `elapsed` the time since the previous fetch.
    pub fn next_step(&self, current: u32, configured: u32, elapsed: Duration) -> u32 {
        let current = current.max(configured);
        let next = if elapsed < self.segment_ttl {
            match current.checked_mul(2) {
                Some(doubled) if doubled <= self.max_step => doubled,
                _ => current,
            }
        } else if elapsed < self.segment_ttl * 2 {
            current
        } else {
            current / 2
        };
        next.max(configured)
    }
}
