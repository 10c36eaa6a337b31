use core::time::Duration;

/// A result type defaulting to this crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All error variants that `segid` can emit.
///
/// Only [`Error::BufferExhausted`], [`Error::StoreUnavailable`] and
/// [`Error::CoordinationUnavailable`] are transient; see
/// [`Error::is_retryable`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The tag has no row in the segment store and auto-registration is
    /// disabled.
    #[error("unknown tag `{tag}`")]
    UnknownTag { tag: String },

    /// The durable store could not be reached, timed out, or reported a
    /// lock conflict.
    ///
    /// A fetch that ends with this error is treated as failed even if the
    /// store may have committed it; the range is never used.
    #[error("segment store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    /// The active segment is exhausted and the standby segment did not become
    /// ready before the wait deadline.
    #[error("segment buffer for `{tag}` exhausted after waiting {waited:?}")]
    BufferExhausted { tag: String, waited: Duration },

    /// The coordination service (leases, snapshots) is unreachable.
    ///
    /// This never affects allocation, only maintenance.
    #[error("coordination unavailable: {reason}")]
    CoordinationUnavailable { reason: String },

    /// Advancing the tag's `max_id` by its step would overflow `i64`.
    #[error("id space exhausted for `{tag}`")]
    RangeOverflow { tag: String },

    /// A caller-supplied argument or configuration value was rejected.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The refill pool is shutting down.
    #[error("allocator is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Whether the caller may retry the whole operation later.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BufferExhausted { .. }
                | Self::StoreUnavailable { .. }
                | Self::CoordinationUnavailable { .. }
        )
    }

    pub(crate) fn unknown_tag(tag: &str) -> Self {
        Self::UnknownTag {
            tag: tag.to_owned(),
        }
    }

    pub(crate) fn store_unavailable(reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::store_unavailable(err.to_string())
    }
}
