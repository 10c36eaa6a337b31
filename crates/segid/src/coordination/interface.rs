use crate::Result;
use core::time::Duration;

/// Cross-instance coordination for maintenance work.
///
/// Nothing here participates in allocation: uniqueness rests entirely on the
/// store's atomic reservation. Every method may fail with
/// [`Error::CoordinationUnavailable`](crate::Error::CoordinationUnavailable),
/// which callers log and ride out.
pub trait Coordinator: Send + Sync + 'static {
    /// Acquires or renews the maintenance lease for `instance_id`.
    ///
    /// Returns `true` while `instance_id` holds the lease. A lease not
    /// renewed within `ttl` lapses and may be taken by another instance.
    fn try_acquire_leadership(
        &self,
        instance_id: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Publishes the tag list new instances should warm up.
    fn publish_snapshot(&self, tags: &[String]) -> impl Future<Output = Result<()>> + Send;

    /// The last published tag list, if any.
    fn load_snapshot(&self) -> impl Future<Output = Result<Option<Vec<String>>>> + Send;
}
