use crate::{
    AllocatorConfig, Error, MemorySegmentStore, Result, RetryConfig, SegmentAllocator,
    SegmentRange, SegmentStore, StepPolicy, TagRecord,
};
use core::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use std::{collections::HashSet, sync::Arc, time::Instant};

/// Counts fetches and optionally delays each one.
struct CountingStore {
    inner: MemorySegmentStore,
    fetches: AtomicUsize,
    delay: Duration,
}

impl CountingStore {
    fn new(tags: &[(&str, i64, u32)], delay: Duration) -> Self {
        Self {
            inner: MemorySegmentStore::with_tags(tags.iter().copied()).expect("valid rows"),
            fetches: AtomicUsize::new(0),
            delay,
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl SegmentStore for CountingStore {
    async fn fetch_next_segment(&self, tag: &str) -> Result<SegmentRange> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.fetch_next_segment(tag).await
    }

    async fn fetch_next_segment_with_step(&self, tag: &str, step: u32) -> Result<SegmentRange> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
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

/// Serves the first fetch, then never answers again.
struct StallingStore {
    inner: MemorySegmentStore,
    served: AtomicUsize,
}

impl SegmentStore for StallingStore {
    async fn fetch_next_segment(&self, tag: &str) -> Result<SegmentRange> {
        if self.served.fetch_add(1, Ordering::SeqCst) > 0 {
            std::future::pending::<()>().await;
        }
        self.inner.fetch_next_segment(tag).await
    }

    async fn fetch_next_segment_with_step(&self, tag: &str, step: u32) -> Result<SegmentRange> {
        std::future::pending::<()>().await;
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

fn store(tags: &[(&str, i64, u32)]) -> Arc<MemorySegmentStore> {
    Arc::new(MemorySegmentStore::with_tags(tags.iter().copied()).expect("valid rows"))
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

fn config() -> AllocatorConfig {
    AllocatorConfig {
        refill_wait: Duration::from_secs(5),
        retry: fast_retry(),
        ..AllocatorConfig::default()
    }
}

async fn max_id<S: SegmentStore>(store: &S, tag: &str) -> i64 {
    store
        .get_tag(tag)
        .await
        .expect("store reachable")
        .expect("tag exists")
        .max_id
}

#[tokio::test]
async fn first_segment_is_served_in_order_then_swapped() -> Result<()> {
    let store = store(&[("order", 1000, 50)]);
    let allocator = SegmentAllocator::new(Arc::clone(&store), config())?;

    for n in 0..50 {
        assert_eq!(allocator.next_id("order").await?, 1000 + n);
    }
    assert_eq!(allocator.next_id("order").await?, 1050);
    assert_eq!(max_id(&*store, "order").await, 1100);

    let snapshot = allocator.snapshot("order").expect("cached");
    assert_eq!(snapshot.current_index, 1);
    assert!(!snapshot.next_ready);
    Ok(())
}

#[tokio::test]
async fn exhausting_a_segment_moves_to_the_next() -> Result<()> {
    let store = store(&[("user", 0, 100)]);
    let allocator = SegmentAllocator::new(store, config())?;

    let ids = allocator.next_ids("user", 101).await?;
    assert_eq!(ids[99], 99);
    assert_eq!(ids[100], 100);
    Ok(())
}

#[tokio::test]
async fn single_caller_sees_increasing_ids() -> Result<()> {
    let store = store(&[("order", 0, 10)]);
    let allocator = SegmentAllocator::new(store, config())?;

    let mut last = -1;
    for _ in 0..1_000 {
        let id = allocator.next_id("order").await?;
        assert!(id > last, "{id} after {last}");
        last = id;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn instances_sharing_a_store_never_collide() -> Result<()> {
    const INSTANCES: usize = 3;
    const TASKS: usize = 8;
    const IDS_PER_TASK: usize = 2_000;

    let store = store(&[("order", 0, 100)]);
    let allocators: Vec<_> = (0..INSTANCES)
        .map(|_| SegmentAllocator::new(Arc::clone(&store), config()).map(Arc::new))
        .collect::<Result<_>>()?;

    let mut handles = Vec::new();
    for allocator in &allocators {
        for _ in 0..TASKS {
            let allocator = Arc::clone(allocator);
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::with_capacity(IDS_PER_TASK);
                for _ in 0..IDS_PER_TASK {
                    ids.push(allocator.next_id("order").await?);
                }
                Ok::<_, Error>(ids)
            }));
        }
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.expect("task completes")? {
            assert!(seen.insert(id), "duplicate id {id}");
        }
    }
    assert_eq!(seen.len(), INSTANCES * TASKS * IDS_PER_TASK);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_use_fetches_once() -> Result<()> {
    let store = Arc::new(CountingStore::new(
        &[("order", 0, 1000)],
        Duration::from_millis(20),
    ));
    let allocator = Arc::new(SegmentAllocator::new(Arc::clone(&store), config())?);

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let allocator = Arc::clone(&allocator);
            tokio::spawn(async move { allocator.next_id("order").await })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.expect("task completes")?);
    }

    assert_eq!(store.fetches(), 1);
    assert_eq!(ids, (0..50).collect());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exhausted_buffer_fails_at_the_wait_deadline() -> Result<()> {
    let store = Arc::new(StallingStore {
        inner: MemorySegmentStore::with_tags([("order", 0, 10)])?,
        served: AtomicUsize::new(0),
    });
    let allocator = SegmentAllocator::new(
        store,
        AllocatorConfig {
            refill_wait: Duration::from_millis(200),
            store_timeout: Duration::from_secs(30),
            retry: RetryConfig {
                max_retries: 0,
                ..fast_retry()
            },
            ..AllocatorConfig::default()
        },
    )?;

    for n in 0..10 {
        assert_eq!(allocator.next_id("order").await?, n);
    }

    let started = tokio::time::Instant::now();
    let err = allocator.next_id("order").await.unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, Error::BufferExhausted { .. }), "{err:?}");
    assert!(err.is_retryable());
    assert!(waited >= Duration::from_millis(200), "{waited:?}");
    assert!(waited < Duration::from_millis(210), "{waited:?}");
    Ok(())
}

#[tokio::test]
async fn overflowing_tag_fails_fast_without_refetching() -> Result<()> {
    let store = Arc::new(CountingStore::new(&[("edge", i64::MAX - 15, 10)], Duration::ZERO));
    let allocator = SegmentAllocator::new(Arc::clone(&store), config())?;

    for n in 0..10 {
        assert_eq!(allocator.next_id("edge").await?, i64::MAX - 15 + n);
    }

    for _ in 0..3 {
        let started = Instant::now();
        let err = allocator.next_id("edge").await.unwrap_err();
        assert!(matches!(err, Error::RangeOverflow { .. }), "{err:?}");
        assert!(!err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
    // First segment plus the one refill that overflowed.
    assert_eq!(store.fetches(), 2);
    Ok(())
}

#[tokio::test]
async fn deleted_tag_fails_fast_and_is_evicted() -> Result<()> {
    let store = Arc::new(CountingStore::new(&[("gone", 0, 10)], Duration::ZERO));
    let allocator = SegmentAllocator::new(Arc::clone(&store), config())?;

    assert_eq!(allocator.next_id("gone").await?, 0);
    assert!(store.inner.remove("gone"));

    // The cached segment still serves; its refill finds no row.
    for n in 1..10 {
        assert_eq!(allocator.next_id("gone").await?, n);
    }

    let started = Instant::now();
    let err = allocator.next_id("gone").await.unwrap_err();
    assert!(matches!(err, Error::UnknownTag { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(store.fetches(), 2);
    assert!(allocator.cached_tags().is_empty());

    // A later call takes the first-use path again.
    let err = allocator.next_id("gone").await.unwrap_err();
    assert!(matches!(err, Error::UnknownTag { .. }), "{err:?}");
    assert_eq!(store.fetches(), 3);

    store.inner.insert("gone", 100, 10)?;
    assert_eq!(allocator.next_id("gone").await?, 100);
    Ok(())
}

#[tokio::test]
async fn unknown_tags_fail_without_auto_registration() -> Result<()> {
    let store = store(&[]);
    let allocator = SegmentAllocator::new(Arc::clone(&store), config())?;

    let err = allocator.next_id("ghost").await.unwrap_err();
    assert_eq!(
        err,
        Error::UnknownTag {
            tag: "ghost".into()
        }
    );
    assert!(store.get_tag("ghost").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn unknown_tags_are_registered_when_enabled() -> Result<()> {
    let store = store(&[]);
    let allocator = SegmentAllocator::new(
        Arc::clone(&store),
        AllocatorConfig {
            auto_register_step: Some(100),
            ..config()
        },
    )?;

    assert_eq!(allocator.next_id("fresh").await?, 0);
    assert_eq!(allocator.next_id("fresh").await?, 1);

    let row = store.get_tag("fresh").await?.expect("registered");
    assert_eq!(row.step, 100);
    Ok(())
}

#[tokio::test]
async fn malformed_tags_are_rejected() -> Result<()> {
    let allocator = SegmentAllocator::new(store(&[]), config())?;
    let too_long = "x".repeat(crate::MAX_TAG_LEN + 1);

    for tag in ["", too_long.as_str()] {
        let err = allocator.next_id(tag).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }), "{err:?}");
    }
    assert!(allocator.cached_tags().is_empty());
    Ok(())
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let err = SegmentAllocator::new(
        store(&[]),
        AllocatorConfig {
            refill_threshold: 2.0,
            ..config()
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
}

#[tokio::test]
async fn prefetch_loads_the_standby() -> Result<()> {
    let store = store(&[("order", 0, 10)]);
    let allocator = SegmentAllocator::new(Arc::clone(&store), config())?;

    assert!(allocator.prefetch("order").await?);
    let snapshot = allocator.snapshot("order").expect("cached");
    assert!(snapshot.initialized);
    assert!(snapshot.next_ready);
    assert_eq!(max_id(&*store, "order").await, 20);

    // A second prefetch has nothing to do.
    assert!(allocator.prefetch("order").await?);
    assert_eq!(max_id(&*store, "order").await, 20);
    Ok(())
}

#[tokio::test]
async fn adaptive_step_grows_for_hot_tags() -> Result<()> {
    let store = store(&[("order", 0, 10)]);
    let allocator = SegmentAllocator::new(
        Arc::clone(&store),
        AllocatorConfig {
            step_policy: Some(StepPolicy::default()),
            ..config()
        },
    )?;

    allocator.next_id("order").await?;
    assert!(allocator.prefetch("order").await?);

    let snapshot = allocator.snapshot("order").expect("cached");
    assert_eq!(snapshot.step, 20);
    assert_eq!(max_id(&*store, "order").await, 30);
    Ok(())
}

#[tokio::test]
async fn sync_tags_tracks_the_store() -> Result<()> {
    let store = store(&[("a", 0, 10), ("b", 0, 10)]);
    let allocator = SegmentAllocator::new(Arc::clone(&store), config())?;
    allocator.next_id("a").await?;

    store.insert("c", 0, 10)?;
    assert!(store.remove("a"));

    let sync = allocator.sync_tags().await?;
    assert_eq!(sync.added, vec!["b".to_owned(), "c".to_owned()]);
    assert_eq!(sync.removed, vec!["a".to_owned()]);
    assert_eq!(allocator.cached_tags(), vec!["b", "c"]);

    // Synced buffers load lazily.
    assert!(!allocator.snapshot("b").expect("cached").initialized);
    assert_eq!(allocator.next_id("b").await?, 0);
    Ok(())
}

#[tokio::test]
async fn warm_up_loads_known_tags_and_reports_failures() -> Result<()> {
    let store = store(&[("a", 0, 10), ("b", 500, 10)]);
    let allocator = SegmentAllocator::new(store, config())?;

    let report = allocator.warm_up(["a", "b", "ghost"]).await;
    assert_eq!(report.warmed, vec!["a", "b"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "ghost");

    assert!(allocator.snapshot("b").expect("cached").initialized);
    assert_eq!(allocator.next_id("b").await?, 500);
    Ok(())
}

#[tokio::test]
async fn warm_up_known_covers_every_stored_tag() -> Result<()> {
    let store = store(&[("a", 0, 10), ("b", 0, 10), ("c", 0, 10)]);
    let allocator = SegmentAllocator::new(store, config())?;

    let report = allocator.warm_up_known().await?;
    assert_eq!(report.warmed, vec!["a", "b", "c"]);
    assert!(report.failed.is_empty());
    Ok(())
}

#[tokio::test]
async fn shutdown_drains_cached_segments_then_refuses() -> Result<()> {
    let store = store(&[("order", 0, 2)]);
    let allocator = SegmentAllocator::new(store, config())?;

    // Crosses the refill threshold, queueing [2, 4) before shutdown.
    assert_eq!(allocator.next_id("order").await?, 0);
    allocator.shutdown().await;

    assert_eq!(allocator.next_ids("order", 3).await?, vec![1, 2, 3]);
    assert_eq!(
        allocator.next_id("order").await.unwrap_err(),
        Error::ServiceShutdown
    );
    assert_eq!(
        allocator.next_id("other").await.unwrap_err(),
        Error::ServiceShutdown
    );
    Ok(())
}
