use crate::{
    AllocatorConfig, Error, Result,
    coordination::Coordinator,
    refill::{RefillPool, RefillRequest, fetch_with_retry},
    segment::{BufferSnapshot, SegmentBuffer},
    store::{SegmentRange, SegmentStore, validate_tag},
};
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::{sync::oneshot, time::Instant};

/// Hands out unique, per-tag increasing `i64` IDs from cached segments.
///
/// Each tag gets a [`SegmentBuffer`] on first use. The hot path is one atomic
/// `fetch_add` on the buffer's current segment; the store is only touched
/// when a buffer is created or refilled. Refills run on a [`RefillPool`]
/// owned by the allocator.
///
/// Several allocators (in one process or many) may share a store. IDs stay
/// unique across all of them because every segment comes from the store's
/// atomic reservation.
///
/// ```
/// use segid::{AllocatorConfig, MemorySegmentStore, SegmentAllocator};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> segid::Result<()> {
/// let store = Arc::new(MemorySegmentStore::with_tags([("order", 1000, 50)])?);
/// let allocator = SegmentAllocator::new(store, AllocatorConfig::default())?;
///
/// assert_eq!(allocator.next_id("order").await?, 1000);
/// assert_eq!(allocator.next_id("order").await?, 1001);
/// # Ok(())
/// # }
/// ```
pub struct SegmentAllocator<S: SegmentStore> {
    store: Arc<S>,
    config: Arc<AllocatorConfig>,
    buffers: RwLock<HashMap<String, Arc<SegmentBuffer>>>,
    pool: RefillPool,
}

/// Outcome of a warm-up pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmUpReport {
    pub warmed: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

/// Cache changes made by [`SegmentAllocator::sync_tags`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSync {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl<S: SegmentStore> SegmentAllocator<S> {
    /// Builds an allocator and spawns its refill workers.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `config` fails
    /// [`AllocatorConfig::validate`].
    pub fn new(store: Arc<S>, config: AllocatorConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let pool = RefillPool::spawn(Arc::clone(&store), Arc::clone(&config));
        Ok(Self {
            store,
            config,
            buffers: RwLock::new(HashMap::new()),
            pool,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Returns the next ID for `tag`.
    ///
    /// IDs from one segment are strictly increasing. Across segment swaps
    /// they increase as long as the store reserves ranges in order, which
    /// both bundled stores do.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] for a malformed tag.
    /// - [`Error::UnknownTag`] if the tag is not in the store and
    ///   auto-registration is off, including a tag deleted while cached.
    /// - [`Error::RangeOverflow`] once the tag's `i64` range is used up.
    /// - [`Error::StoreUnavailable`] if the first segment cannot be loaded.
    /// - [`Error::BufferExhausted`] if the current segment ran out and no
    ///   standby arrived within `refill_wait`.
    /// - [`Error::ServiceShutdown`] after [`shutdown`](Self::shutdown), once
    ///   the cached segments are used up.
    pub async fn next_id(&self, tag: &str) -> Result<i64> {
        let buffer = self.ready_buffer(tag).await?;
        self.claim(&buffer).await
    }

    /// Returns `count` IDs for `tag`, in allocation order.
    ///
    /// The IDs are drawn one by one and may span segments. On error, IDs
    /// already drawn are lost.
    pub async fn next_ids(&self, tag: &str, count: usize) -> Result<Vec<i64>> {
        let buffer = self.ready_buffer(tag).await?;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.claim(&buffer).await?);
        }
        Ok(ids)
    }

    /// Loads the first segment of every tag in `tags`.
    ///
    /// Failures are collected rather than returned; a tag that fails here is
    /// retried on its first [`next_id`](Self::next_id).
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip_all))]
    pub async fn warm_up<I, T>(&self, tags: I) -> WarmUpReport
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let tags: Vec<String> = tags.into_iter().map(|t| t.as_ref().to_owned()).collect();
        let results =
            futures::future::join_all(tags.iter().map(|tag| self.ready_buffer(tag))).await;

        let mut report = WarmUpReport::default();
        for (tag, result) in tags.into_iter().zip(results) {
            match result {
                Ok(_) => report.warmed.push(tag),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(tag, error = %e, "Warm-up failed");
                    report.failed.push((tag, e));
                }
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            warmed = report.warmed.len(),
            failed = report.failed.len(),
            "Warm-up complete"
        );
        report
    }

    /// Warms every tag the store knows.
    ///
    /// # Errors
    /// Returns the store's error if the tag list cannot be read.
    pub async fn warm_up_known(&self) -> Result<WarmUpReport> {
        let tags = self.store.list_tags().await?;
        Ok(self.warm_up(tags).await)
    }

    /// Warms the tags in `coordinator`'s published snapshot.
    ///
    /// Falls back to the store's tag list when no snapshot exists or the
    /// coordinator is unreachable.
    ///
    /// # Errors
    /// Returns the store's error if the fallback tag list cannot be read.
    pub async fn warm_up_from<C: Coordinator>(&self, coordinator: &C) -> Result<WarmUpReport> {
        match coordinator.load_snapshot().await {
            Ok(Some(tags)) => return Ok(self.warm_up(tags).await),
            Ok(None) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("No tag snapshot published, warming from store");
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_e, "Tag snapshot unavailable, warming from store");
            }
        }
        self.warm_up_known().await
    }

    /// Ensures `tag`'s standby segment is loaded.
    ///
    /// Returns whether a standby is ready afterwards. Waits at most
    /// `refill_wait`.
    ///
    /// # Errors
    /// Any error from loading the first segment or from the refill itself.
    pub async fn prefetch(&self, tag: &str) -> Result<bool> {
        let buffer = self.ready_buffer(tag).await?;
        if buffer.is_next_ready() {
            return Ok(true);
        }

        let deadline = Instant::now() + self.config.refill_wait;
        if buffer.try_begin_refill() {
            let (tx, rx) = oneshot::channel();
            self.submit(&buffer, Some(tx))?;
            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(result)) => result?,
                Ok(Err(_)) => return Err(Error::ServiceShutdown),
                Err(_) => return Err(self.exhausted(&buffer)),
            }
        } else if !buffer.refill_settled(deadline).await {
            return Err(self.exhausted(&buffer));
        }
        Ok(buffer.is_next_ready())
    }

    /// Reconciles cached buffers with the store's tag list.
    ///
    /// Tags new to the store get an (uninitialised) buffer; cached tags the
    /// store no longer has are evicted.
    ///
    /// # Errors
    /// Returns the store's error if the tag list cannot be read; the cache
    /// is left untouched.
    pub async fn sync_tags(&self) -> Result<TagSync> {
        let known: HashSet<String> = self.store.list_tags().await?.into_iter().collect();
        let mut sync = TagSync::default();

        let mut buffers = self.buffers.write();
        buffers.retain(|tag, _| {
            let keep = known.contains(tag);
            if !keep {
                sync.removed.push(tag.clone());
            }
            keep
        });
        for tag in known {
            if !buffers.contains_key(&tag) {
                buffers.insert(tag.clone(), Arc::new(SegmentBuffer::new(tag.clone())));
                sync.added.push(tag);
            }
        }
        drop(buffers);

        sync.added.sort_unstable();
        sync.removed.sort_unstable();

        #[cfg(feature = "tracing")]
        if !sync.added.is_empty() || !sync.removed.is_empty() {
            tracing::info!(added = ?sync.added, removed = ?sync.removed, "Tag cache synchronised");
        }
        Ok(sync)
    }

    /// A point-in-time view of `tag`'s buffer, if cached.
    pub fn snapshot(&self, tag: &str) -> Option<BufferSnapshot> {
        self.buffers.read().get(tag).map(|buffer| buffer.snapshot())
    }

    /// Cached tags, sorted.
    pub fn cached_tags(&self) -> Vec<String> {
        let mut tags: Vec<_> = self.buffers.read().keys().cloned().collect();
        tags.sort_unstable();
        tags
    }

    /// Stops the refill workers.
    ///
    /// Allocation continues from already cached segments; once those run
    /// out, callers get [`Error::ServiceShutdown`].
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Returns `tag`'s buffer with its first segment loaded.
    async fn ready_buffer(&self, tag: &str) -> Result<Arc<SegmentBuffer>> {
        validate_tag(tag)?;
        let buffer = self.buffer(tag);
        if !buffer.is_initialized() {
            if self.pool.is_shut_down() {
                return Err(Error::ServiceShutdown);
            }
            buffer.init_with(|| self.fetch_first(tag)).await?;
        }
        Ok(buffer)
    }

    fn buffer(&self, tag: &str) -> Arc<SegmentBuffer> {
        if let Some(buffer) = self.buffers.read().get(tag) {
            return Arc::clone(buffer);
        }
        let mut buffers = self.buffers.write();
        Arc::clone(
            buffers
                .entry(tag.to_owned())
                .or_insert_with(|| Arc::new(SegmentBuffer::new(tag))),
        )
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self)))]
    async fn fetch_first(&self, tag: &str) -> Result<SegmentRange> {
        match fetch_with_retry(&*self.store, tag, None, &self.config).await {
            Err(Error::UnknownTag { .. }) => {
                let Some(step) = self.config.auto_register_step else {
                    return Err(Error::unknown_tag(tag));
                };
                #[cfg(feature = "tracing")]
                tracing::info!(tag, step, "Registering unknown tag");
                self.store.register_tag(tag, 0, step).await?;
                fetch_with_retry(&*self.store, tag, None, &self.config).await
            }
            other => other,
        }
    }

    async fn claim(&self, buffer: &Arc<SegmentBuffer>) -> Result<i64> {
        let mut deadline = None;
        loop {
            if let Some(id) = buffer.try_claim() {
                if buffer.should_refill(self.config.refill_threshold) {
                    // Running out later is reported to whoever hits it.
                    let _ = self.schedule_refill(buffer);
                }
                return Ok(id);
            }
            if buffer.try_swap() {
                continue;
            }

            let deadline =
                *deadline.get_or_insert_with(|| Instant::now() + self.config.refill_wait);
            match buffer.refill_error() {
                Some(e) if !e.is_retryable() => return Err(self.refill_failed(buffer, e)),
                // The last refill already exhausted its retries; pause before
                // sending the store another one.
                Some(_) if !buffer.is_refill_running() => {
                    let resume = (Instant::now() + self.config.retry.initial_delay).min(deadline);
                    tokio::time::sleep_until(resume).await;
                    if resume >= deadline {
                        return Err(self.exhausted(buffer));
                    }
                }
                _ => {}
            }

            self.schedule_refill(buffer)?;
            if !buffer.wait_for_refill(deadline).await {
                return Err(self.exhausted(buffer));
            }
        }
    }

    /// Surfaces a refill failure that retrying cannot fix.
    ///
    /// A buffer whose tag vanished from the store is evicted, so a tag
    /// registered again later starts from a fresh first fetch.
    fn refill_failed(&self, buffer: &Arc<SegmentBuffer>, err: Error) -> Error {
        #[cfg(feature = "tracing")]
        tracing::warn!(tag = buffer.tag(), error = %err, "Segment refill failed permanently");
        if matches!(err, Error::UnknownTag { .. }) {
            let mut buffers = self.buffers.write();
            if buffers
                .get(buffer.tag())
                .is_some_and(|cached| Arc::ptr_eq(cached, buffer))
            {
                buffers.remove(buffer.tag());
            }
        }
        err
    }

    /// Queues a background refill unless one is ready or running.
    fn schedule_refill(&self, buffer: &Arc<SegmentBuffer>) -> Result<()> {
        if buffer.is_next_ready() || !buffer.try_begin_refill() {
            return Ok(());
        }
        self.submit(buffer, None)
    }

    /// Hands a buffer whose refill flag is held to the pool.
    fn submit(
        &self,
        buffer: &Arc<SegmentBuffer>,
        done: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        let request = RefillRequest::Fill {
            buffer: Arc::clone(buffer),
            done,
        };
        self.pool.submit(request).inspect_err(|_| buffer.end_refill())
    }

    fn exhausted(&self, buffer: &SegmentBuffer) -> Error {
        #[cfg(feature = "tracing")]
        tracing::warn!(tag = buffer.tag(), "Segment buffer exhausted");
        Error::BufferExhausted {
            tag: buffer.tag().to_owned(),
            waited: self.config.refill_wait,
        }
    }
}

impl<S: SegmentStore> core::fmt::Debug for SegmentAllocator<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SegmentAllocator")
            .field("config", &self.config)
            .field("tags", &self.buffers.read().len())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
