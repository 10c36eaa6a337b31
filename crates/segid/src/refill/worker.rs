use crate::{
    AllocatorConfig, Error, Result,
    refill::RefillRequest,
    segment::SegmentBuffer,
    store::{SegmentRange, SegmentStore},
};
use backon::Retryable;
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Worker task that services [`RefillRequest`]s for any tag.
///
/// Requests are handled one at a time. Every store call is bounded by
/// `store_timeout` and retried per `retry`, so a dead store delays a worker
/// by a bounded amount instead of wedging it.
///
/// The loop ends on [`RefillRequest::Shutdown`] or when every sender has been
/// dropped.
pub async fn worker_loop<S: SegmentStore>(
    _worker_id: usize,
    mut rx: mpsc::UnboundedReceiver<RefillRequest>,
    store: Arc<S>,
    config: Arc<AllocatorConfig>,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Refill worker {_worker_id} started");

    while let Some(work) = rx.recv().await {
        match work {
            RefillRequest::Fill { buffer, done } => {
                let result = refill_standby(&*store, &buffer, &config).await;
                if let Err(e) = &result {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        worker_id = _worker_id,
                        tag = buffer.tag(),
                        error = %e,
                        "Refill failed; standby left empty"
                    );
                    buffer.fail_refill(e.clone());
                }
                buffer.end_refill();

                if let Some(done) = done {
                    let _ = done.send(result);
                }
            }
            RefillRequest::Shutdown { response } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Refill worker {_worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Refill worker {_worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Refill worker {_worker_id} stopped");
}

/// Loads the next segment into `buffer`'s standby slot.
///
/// A no-op if the standby is already ready. With a [`StepPolicy`]
/// configured, the fetch size adapts to how long the previous segment
/// lasted.
///
/// [`StepPolicy`]: crate::segment::StepPolicy
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(tag = buffer.tag())))]
pub async fn refill_standby<S: SegmentStore>(
    store: &S,
    buffer: &SegmentBuffer,
    config: &AllocatorConfig,
) -> Result<()> {
    if buffer.is_next_ready() {
        return Ok(());
    }

    let step = config.step_policy.and_then(|policy| {
        let elapsed = buffer.since_last_refill()?;
        Some(policy.next_step(buffer.step(), buffer.configured_step(), elapsed))
    });

    let range = fetch_with_retry(store, buffer.tag(), step, config).await?;

    if !buffer.install_standby(range) {
        // Unreachable while the caller holds the refill flag; the range is
        // dropped rather than reused.
        #[cfg(feature = "tracing")]
        tracing::warn!(start = range.start, end = range.end, "Standby already ready, discarding range");
    } else {
        #[cfg(feature = "tracing")]
        tracing::debug!(start = range.start, end = range.end, "Standby segment ready");
    }
    Ok(())
}

/// Reserves a range for `tag`, retrying transient store failures.
///
/// Each attempt is bounded by `config.store_timeout`. A timed-out attempt is
/// treated as failed: the store may have committed it, but that range is
/// never handed out.
pub(crate) async fn fetch_with_retry<S: SegmentStore>(
    store: &S,
    tag: &str,
    step: Option<u32>,
    config: &AllocatorConfig,
) -> Result<SegmentRange> {
    let timeout = config.store_timeout;

    (move || async move {
        let fetch = async {
            match step {
                Some(step) => store.fetch_next_segment_with_step(tag, step).await,
                None => store.fetch_next_segment(tag).await,
            }
        };
        tokio::time::timeout(timeout, fetch).await.map_err(|_| {
            Error::store_unavailable(format!("fetch for `{tag}` timed out after {timeout:?}"))
        })?
    })
    .retry(config.retry.backoff())
    .when(|e: &Error| matches!(e, Error::StoreUnavailable { .. }))
    .notify(|_err: &Error, _dur: Duration| {
        #[cfg(feature = "tracing")]
        tracing::warn!(tag, error = %_err, retry_in = ?_dur, "Segment fetch failed, retrying");
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RetryConfig, store::MemorySegmentStore, store::TagRecord};
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` fetches with `StoreUnavailable`.
    struct FlakyStore {
        inner: MemorySegmentStore,
        failures: usize,
        calls: AtomicUsize,
    }

    impl SegmentStore for FlakyStore {
        async fn fetch_next_segment(&self, tag: &str) -> Result<SegmentRange> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(Error::store_unavailable("connection refused"));
            }
            self.inner.fetch_next_segment(tag).await
        }

        async fn fetch_next_segment_with_step(&self, tag: &str, step: u32) -> Result<SegmentRange> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_next_segment_with_step(tag, step).await
        }

        async fn register_tag(&self, tag: &str, start: i64, step: u32) -> Result<TagRecord> {
            self.inner.register_tag(tag, start, step).await
        }

        async fn get_tag(&self, tag: &str) -> Result<Option<TagRecord>> {
            self.inner.get_tag(tag).await
        }

        async fn list_tags(&self) -> Result<Vec<String>> {
            self.inner.list_tags().await
        }
    }

    fn config(max_retries: usize) -> AllocatorConfig {
        AllocatorConfig {
            retry: RetryConfig {
                max_retries,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..AllocatorConfig::default()
        }
    }

    fn flaky(failures: usize) -> FlakyStore {
        FlakyStore {
            inner: MemorySegmentStore::with_tags([("order", 0, 10)]).expect("valid row"),
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() -> Result<()> {
        let store = flaky(2);
        let range = fetch_with_retry(&store, "order", None, &config(3)).await?;
        assert_eq!((range.start, range.end), (0, 10));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let store = flaky(usize::MAX);
        let err = fetch_with_retry(&store, "order", None, &config(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable { .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unknown_tag_is_not_retried() {
        let store = flaky(0);
        let err = fetch_with_retry(&store, "missing", None, &config(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTag { .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refill_fills_the_standby_once() -> Result<()> {
        let store = flaky(0);
        let buffer = SegmentBuffer::new("order");
        buffer
            .init_with(|| store.fetch_next_segment("order"))
            .await?;

        refill_standby(&store, &buffer, &config(0)).await?;
        assert!(buffer.is_next_ready());
        assert_eq!(buffer.snapshot().segments[1].start, 10);

        // Already ready: no further store traffic.
        refill_standby(&store, &buffer, &config(0)).await?;
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn adaptive_step_grows_for_hot_tags() -> Result<()> {
        let store = flaky(0);
        let buffer = SegmentBuffer::new("order");
        buffer
            .init_with(|| store.fetch_next_segment("order"))
            .await?;

        let config = AllocatorConfig {
            step_policy: Some(crate::segment::StepPolicy::default()),
            ..config(0)
        };
        refill_standby(&store, &buffer, &config).await?;

        let standby = buffer.snapshot().segments[1];
        assert_eq!((standby.start, standby.end), (10, 30));
        assert_eq!(buffer.step(), 20);
        Ok(())
    }
}
