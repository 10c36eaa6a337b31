use crate::{Error, Result, segment::StepPolicy, store::validate_step};
use backon::ExponentialBuilder;
use core::time::Duration;

/// Bounded exponential backoff for store fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    pub(crate) fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

/// Tuning for a [`SegmentAllocator`](crate::SegmentAllocator).
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorConfig {
    /// Fraction of the current segment consumed before the standby is
    /// refilled in the background. Must be in `[0, 1)`.
    pub refill_threshold: f64,

    /// How long a caller waits for a standby when the current segment is
    /// exhausted before giving up with [`Error::BufferExhausted`].
    pub refill_wait: Duration,

    /// Upper bound on a single store call.
    pub store_timeout: Duration,

    pub retry: RetryConfig,

    /// Number of background refill workers.
    pub refill_workers: usize,

    /// Per-worker acknowledgement timeout during shutdown.
    pub shutdown_timeout: Duration,

    /// When set, a tag missing from the store is registered on first use
    /// with `max_id = 0` and this step. When unset, such tags fail with
    /// [`Error::UnknownTag`].
    pub auto_register_step: Option<u32>,

    /// When set, refills size each fetch adaptively instead of using the
    /// tag's persisted step.
    pub step_policy: Option<StepPolicy>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            refill_threshold: 0.1,
            refill_wait: Duration::from_millis(500),
            store_timeout: Duration::from_secs(3),
            retry: RetryConfig::default(),
            refill_workers: 2,
            shutdown_timeout: Duration::from_secs(3),
            auto_register_step: None,
            step_policy: None,
        }
    }
}

impl AllocatorConfig {
    /// Checks every field for a usable value.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.refill_threshold) {
            return Err(Error::invalid(format!(
                "refill_threshold must be in [0, 1), got {}",
                self.refill_threshold
            )));
        }
        if self.refill_wait.is_zero() {
            return Err(Error::invalid("refill_wait must be positive"));
        }
        if self.store_timeout.is_zero() {
            return Err(Error::invalid("store_timeout must be positive"));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(Error::invalid("retry initial_delay exceeds max_delay"));
        }
        if self.refill_workers == 0 {
            return Err(Error::invalid("refill_workers must be at least 1"));
        }
        if let Some(step) = self.auto_register_step {
            validate_step(step)?;
        }
        if let Some(policy) = self.step_policy {
            if policy.segment_ttl.is_zero() {
                return Err(Error::invalid("segment_ttl must be positive"));
            }
            validate_step(policy.max_step)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(AllocatorConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        for threshold in [-0.1, 1.0, f64::NAN] {
            let config = AllocatorConfig {
                refill_threshold: threshold,
                ..AllocatorConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(Error::InvalidArgument { .. })
            ));
        }
    }

    #[test]
    fn rejects_zero_durations_and_workers() {
        let bad = [
            AllocatorConfig {
                refill_wait: Duration::ZERO,
                ..AllocatorConfig::default()
            },
            AllocatorConfig {
                store_timeout: Duration::ZERO,
                ..AllocatorConfig::default()
            },
            AllocatorConfig {
                refill_workers: 0,
                ..AllocatorConfig::default()
            },
            AllocatorConfig {
                auto_register_step: Some(0),
                ..AllocatorConfig::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }
}
