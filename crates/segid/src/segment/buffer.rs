use crate::{Error, Result, segment::Segment, store::SegmentRange};
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{Notify, OnceCell};

/// Double-buffered segment cache for one tag.
///
/// Allocators claim from the current slot with a single atomic `fetch_add`.
/// The standby slot is written only by the refill that won the
/// single-flight flag, and only while `next_ready` is false. Swapping slots
/// and publishing a standby both happen under `swap_lock`, so a ready standby
/// is never overwritten and two threads never swap at once.
///
/// The outcome of the last failed refill is kept until a standby is
/// installed. A non-retryable failure (the tag's ID space ran out, or its
/// row is gone) stops further threshold refills for the buffer.
pub struct SegmentBuffer {
    tag: String,
    segments: [Segment; 2],
    current: AtomicUsize,
    next_ready: AtomicBool,
    refill_running: AtomicBool,
    initialized: OnceCell<()>,
    step: AtomicU32,
    configured_step: AtomicU32,
    last_refill: Mutex<Option<Instant>>,
    refill_error: Mutex<Option<Error>>,
    swap_lock: Mutex<()>,
    refilled: Notify,
}

impl SegmentBuffer {
    /// Creates an uninitialised buffer. Both slots start exhausted.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            segments: [Segment::empty(), Segment::empty()],
            current: AtomicUsize::new(0),
            next_ready: AtomicBool::new(false),
            refill_running: AtomicBool::new(false),
            initialized: OnceCell::new(),
            step: AtomicU32::new(0),
            configured_step: AtomicU32::new(0),
            last_refill: Mutex::new(None),
            refill_error: Mutex::new(None),
            swap_lock: Mutex::new(()),
            refilled: Notify::new(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Runs `fetch` once to load the first segment into the current slot.
    ///
    /// Concurrent callers wait on the same initialisation; if it fails, the
    /// next caller tries again.
    pub(crate) async fn init_with<F, Fut>(&self, fetch: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SegmentRange>>,
    {
        self.initialized
            .get_or_try_init(|| async move {
                let range = fetch().await?;
                self.current_segment().reset(range);
                self.record_refill(range);
                Ok::<_, crate::Error>(())
            })
            .await
            .map(|_| ())
    }

    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn current_segment(&self) -> &Segment {
        &self.segments[self.current_index()]
    }

    pub fn is_next_ready(&self) -> bool {
        self.next_ready.load(Ordering::Acquire)
    }

    pub fn is_refill_running(&self) -> bool {
        self.refill_running.load(Ordering::Acquire)
    }

    /// Step of the most recently loaded segment.
    pub fn step(&self) -> u32 {
        self.step.load(Ordering::Relaxed)
    }

    /// Step persisted for the tag, as reported by the last fetch.
    pub fn configured_step(&self) -> u32 {
        self.configured_step.load(Ordering::Relaxed)
    }

    /// Time since the most recent segment was loaded.
    pub fn since_last_refill(&self) -> Option<Duration> {
        self.last_refill.lock().map(|at| at.elapsed())
    }

    /// Claims the next ID from the current slot.
    ///
    /// A claimer can be preempted between reading the current index and
    /// claiming, long enough for the slots to swap and the old slot to take
    /// a newer standby. Such a claim is dropped and retried on the current
    /// slot, so segments are consumed in the order they were fetched. The
    /// dropped ID is never handed out.
    #[inline]
    pub fn try_claim(&self) -> Option<i64> {
        loop {
            match self.claim_slot(self.current_index()) {
                SlotClaim::Claimed(id) => return Some(id),
                SlotClaim::Exhausted => return None,
                SlotClaim::Retired => continue,
            }
        }
    }

    #[inline]
    fn claim_slot(&self, index: usize) -> SlotClaim {
        let Some(id) = self.segments[index].try_claim() else {
            return SlotClaim::Exhausted;
        };
        if self.current_index() == index {
            SlotClaim::Claimed(id)
        } else {
            SlotClaim::Retired
        }
    }

    /// Whether the current slot is consumed past `threshold` with no standby
    /// loaded, no refill in flight and no permanent refill failure.
    pub fn should_refill(&self, threshold: f64) -> bool {
        !self.is_next_ready()
            && !self.is_refill_running()
            && self.permanent_failure().is_none()
            && self.current_segment().consumed_beyond(threshold)
    }

    /// Records why the last refill failed. Call before [`end_refill`](Self::end_refill).
    pub fn fail_refill(&self, err: Error) {
        *self.refill_error.lock() = Some(err);
    }

    /// Error of the last refill, if it failed and no standby arrived since.
    pub fn refill_error(&self) -> Option<Error> {
        self.refill_error.lock().clone()
    }

    /// The last refill error, if retrying cannot fix it.
    pub fn permanent_failure(&self) -> Option<Error> {
        self.refill_error().filter(|e| !e.is_retryable())
    }

    /// Takes the single-flight refill flag. Returns `false` if another refill
    /// holds it.
    pub fn try_begin_refill(&self) -> bool {
        self.refill_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the refill flag and wakes waiters, whatever the outcome.
    pub fn end_refill(&self) {
        self.refill_running.store(false, Ordering::Release);
        self.refilled.notify_waiters();
    }

    /// Loads `range` into the standby slot and marks it ready.
    ///
    /// Returns `false` without touching anything if a standby is already
    /// ready.
    pub fn install_standby(&self, range: SegmentRange) -> bool {
        let guard = self.swap_lock.lock();
        if self.is_next_ready() {
            return false;
        }
        let standby = 1 - self.current_index();
        self.segments[standby].reset(range);
        self.record_refill(range);
        *self.refill_error.lock() = None;
        self.next_ready.store(true, Ordering::Release);
        drop(guard);
        self.refilled.notify_waiters();
        true
    }

    /// Makes the current slot usable again.
    ///
    /// Returns `true` if the current slot has room, either because another
    /// thread already swapped or because the ready standby was swapped in
    /// now. Returns `false` if the current slot is exhausted and no standby is
    /// ready.
    pub fn try_swap(&self) -> bool {
        let _guard = self.swap_lock.lock();
        let current = self.current_index();
        if !self.segments[current].is_exhausted() {
            return true;
        }
        if !self.is_next_ready() {
            return false;
        }
        self.current.store(1 - current, Ordering::Release);
        self.next_ready.store(false, Ordering::Release);
        true
    }

    /// Waits until a refill finishes or `deadline` passes.
    ///
    /// Returns `false` only on timeout. A `true` result means the caller
    /// should look at the buffer again; the refill may have failed.
    pub async fn wait_for_refill(&self, deadline: tokio::time::Instant) -> bool {
        let notified = self.refilled.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_next_ready() || !self.current_segment().is_exhausted() {
            return true;
        }
        tokio::time::timeout_at(deadline, notified).await.is_ok()
    }

    /// Waits until no refill is in flight or `deadline` passes.
    ///
    /// Returns `false` on timeout.
    pub async fn refill_settled(&self, deadline: tokio::time::Instant) -> bool {
        loop {
            let notified = self.refilled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_refill_running() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    fn record_refill(&self, range: SegmentRange) {
        self.step
            .store(u32::try_from(range.len()).unwrap_or(u32::MAX), Ordering::Relaxed);
        self.configured_step.store(range.step, Ordering::Relaxed);
        *self.last_refill.lock() = Some(Instant::now());
    }

    /// A point-in-time view of the buffer.
    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            tag: self.tag.clone(),
            initialized: self.is_initialized(),
            current_index: self.current_index(),
            next_ready: self.is_next_ready(),
            refill_running: self.is_refill_running(),
            step: self.step(),
            segments: [
                SegmentSnapshot::of(&self.segments[0]),
                SegmentSnapshot::of(&self.segments[1]),
            ],
        }
    }
}

impl core::fmt::Debug for SegmentBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SegmentBuffer")
            .field("tag", &self.tag)
            .field("current", &self.current_index())
            .field("next_ready", &self.is_next_ready())
            .field("segments", &self.segments)
            .finish_non_exhaustive()
    }
}

enum SlotClaim {
    Claimed(i64),
    Exhausted,
    /// Claimed from a slot that stopped being current mid-claim.
    Retired,
}

/// Read-only view of one [`SegmentBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSnapshot {
    pub tag: String,
    pub initialized: bool,
    pub current_index: usize,
    pub next_ready: bool,
    pub refill_running: bool,
    pub step: u32,
    pub segments: [SegmentSnapshot; 2],
}

/// Read-only view of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSnapshot {
    pub start: i64,
    pub cursor: i64,
    pub end: i64,
    pub idle: i64,
}

impl SegmentSnapshot {
    fn of(segment: &Segment) -> Self {
        let end = segment.end();
        Self {
            start: segment.start(),
            cursor: segment.cursor().min(end),
            end,
            idle: segment.idle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: i64, end: i64) -> SegmentRange {
        SegmentRange {
            start,
            end,
            step: (end - start) as u32,
        }
    }

    async fn initialized(start: i64, end: i64) -> SegmentBuffer {
        let buffer = SegmentBuffer::new("order");
        buffer
            .init_with(|| async move { Ok(range(start, end)) })
            .await
            .expect("init");
        buffer
    }

    #[tokio::test]
    async fn init_runs_once() -> Result<()> {
        let buffer = SegmentBuffer::new("order");
        assert!(!buffer.is_initialized());

        buffer.init_with(|| async { Ok(range(0, 10)) }).await?;
        buffer.init_with(|| async { Ok(range(50, 60)) }).await?;

        assert!(buffer.is_initialized());
        assert_eq!(buffer.try_claim(), Some(0));
        assert_eq!(buffer.step(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn failed_init_can_be_retried() -> Result<()> {
        let buffer = SegmentBuffer::new("order");
        let err = buffer
            .init_with(|| async { Err(crate::Error::store_unavailable("down")) })
            .await;
        assert!(err.is_err());
        assert!(!buffer.is_initialized());

        buffer.init_with(|| async { Ok(range(7, 8)) }).await?;
        assert_eq!(buffer.try_claim(), Some(7));
        Ok(())
    }

    #[tokio::test]
    async fn swap_requires_a_ready_standby() {
        let buffer = initialized(0, 2).await;
        assert_eq!(buffer.try_claim(), Some(0));
        assert_eq!(buffer.try_claim(), Some(1));
        assert_eq!(buffer.try_claim(), None);
        assert!(!buffer.try_swap());

        assert!(buffer.install_standby(range(2, 4)));
        assert!(buffer.is_next_ready());
        assert!(buffer.try_swap());
        assert_eq!(buffer.current_index(), 1);
        assert!(!buffer.is_next_ready());
        assert_eq!(buffer.try_claim(), Some(2));
    }

    #[tokio::test]
    async fn ready_standby_is_never_overwritten() {
        let buffer = initialized(0, 10).await;
        assert!(buffer.install_standby(range(10, 20)));
        assert!(!buffer.install_standby(range(20, 30)));
        assert_eq!(buffer.snapshot().segments[1].start, 10);
    }

    #[tokio::test]
    async fn swap_is_a_no_op_while_current_has_room() {
        let buffer = initialized(0, 10).await;
        assert!(buffer.install_standby(range(10, 20)));
        assert!(buffer.try_swap());
        assert_eq!(buffer.current_index(), 0);
        assert!(buffer.is_next_ready());
    }

    #[tokio::test]
    async fn claims_from_a_retired_slot_are_dropped() {
        let buffer = initialized(0, 2).await;
        assert!(buffer.install_standby(range(2, 4)));
        assert_eq!(buffer.try_claim(), Some(0));
        assert_eq!(buffer.try_claim(), Some(1));
        assert!(buffer.try_swap());
        assert_eq!(buffer.current_index(), 1);

        // The old slot takes a newer range while [2, 4) is still current.
        assert!(buffer.install_standby(range(4, 6)));
        assert!(matches!(buffer.claim_slot(0), SlotClaim::Retired));

        assert_eq!(buffer.try_claim(), Some(2));
        assert_eq!(buffer.try_claim(), Some(3));
        assert_eq!(buffer.try_claim(), None);
        assert!(buffer.try_swap());
        // 4 went to the dropped claim.
        assert_eq!(buffer.try_claim(), Some(5));
    }

    #[tokio::test]
    async fn permanent_failures_stop_threshold_refills() {
        let buffer = initialized(0, 10).await;
        buffer.try_claim();
        buffer.try_claim();
        assert!(buffer.should_refill(0.1));

        buffer.fail_refill(Error::store_unavailable("down"));
        assert!(buffer.should_refill(0.1));
        assert!(buffer.permanent_failure().is_none());

        buffer.fail_refill(Error::RangeOverflow { tag: "order".into() });
        assert!(!buffer.should_refill(0.1));
        assert!(matches!(
            buffer.permanent_failure(),
            Some(Error::RangeOverflow { .. })
        ));

        assert!(buffer.install_standby(range(10, 20)));
        assert!(buffer.refill_error().is_none());
    }

    #[tokio::test]
    async fn refill_flag_is_single_flight() {
        let buffer = initialized(0, 10).await;
        assert!(buffer.try_begin_refill());
        assert!(!buffer.try_begin_refill());
        buffer.end_refill();
        assert!(buffer.try_begin_refill());
    }

    #[tokio::test]
    async fn should_refill_past_threshold() {
        let buffer = initialized(0, 10).await;
        buffer.try_claim();
        assert!(!buffer.should_refill(0.1));
        buffer.try_claim();
        assert!(buffer.should_refill(0.1));

        assert!(buffer.try_begin_refill());
        assert!(!buffer.should_refill(0.1));
    }

    #[tokio::test]
    async fn waiter_times_out_without_refill() {
        let buffer = initialized(0, 1).await;
        buffer.try_claim();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(20);
        assert!(!buffer.wait_for_refill(deadline).await);
    }

    #[tokio::test]
    async fn settled_once_flag_is_released() {
        let buffer = std::sync::Arc::new(initialized(0, 10).await);
        assert!(buffer.try_begin_refill());

        let deadline = tokio::time::Instant::now() + Duration::from_millis(20);
        assert!(!buffer.refill_settled(deadline).await);

        let refiller = std::sync::Arc::clone(&buffer);
        tokio::spawn(async move { refiller.end_refill() });
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        assert!(buffer.refill_settled(deadline).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waiter_wakes_on_install() {
        let buffer = std::sync::Arc::new(initialized(0, 1).await);
        buffer.try_claim();

        let filler = std::sync::Arc::clone(&buffer);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            filler.install_standby(range(1, 2));
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        assert!(buffer.wait_for_refill(deadline).await);
        assert!(buffer.try_swap());
        assert_eq!(buffer.try_claim(), Some(1));
    }
}
