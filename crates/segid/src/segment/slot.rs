use crate::store::SegmentRange;
use portable_atomic::{AtomicI64, AtomicU128, Ordering};

const CURSOR_MASK: u128 = u64::MAX as u128;

/// One allocatable range `[start, end)` of a double buffer.
///
/// The cursor and the exclusive bound are packed into a single [`AtomicU128`]
/// (`end` in the high word, cursor in the low word). Claiming a slot is one
/// `fetch_add` on the packed word, and a refill replaces both halves with one
/// store, so a claimer can never pair a fresh cursor with a stale bound.
///
/// The cursor keeps moving past `end` on failed claims; that is harmless since
/// every such claim observes `cursor >= end` and is rejected.
pub struct Segment {
    #[cfg(feature = "cache-padded")]
    state: crossbeam_utils::CachePadded<AtomicU128>,
    #[cfg(not(feature = "cache-padded"))]
    state: AtomicU128,
    start: AtomicI64,
}

#[inline]
const fn pack(cursor: i64, end: i64) -> u128 {
    ((end as u64 as u128) << 64) | (cursor as u64 as u128)
}

/// Overdrawn cursors saturate at `i64::MAX` so they never wrap below `end`.
#[inline]
const fn unpack(raw: u128) -> (i64, i64) {
    let cursor = (raw & CURSOR_MASK) as u64;
    let cursor = if cursor > i64::MAX as u64 {
        i64::MAX
    } else {
        cursor as i64
    };
    (cursor, (raw >> 64) as u64 as i64)
}

impl Segment {
    /// An exhausted segment holding no IDs.
    pub const fn empty() -> Self {
        Self {
            #[cfg(feature = "cache-padded")]
            state: crossbeam_utils::CachePadded::new(AtomicU128::new(0)),
            #[cfg(not(feature = "cache-padded"))]
            state: AtomicU128::new(0),
            start: AtomicI64::new(0),
        }
    }

    /// Replaces the segment's range, resetting the cursor to `range.start`.
    pub fn reset(&self, range: SegmentRange) {
        self.start.store(range.start, Ordering::Relaxed);
        self.state
            .store(pack(range.start, range.end), Ordering::Release);
    }

    /// Claims the next ID, or returns `None` once the segment is exhausted.
    #[inline]
    pub fn try_claim(&self) -> Option<i64> {
        let (cursor, end) = unpack(self.state.fetch_add(1, Ordering::AcqRel));
        (cursor < end).then_some(cursor)
    }

    /// Next ID this segment would hand out.
    pub fn cursor(&self) -> i64 {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    /// Exclusive upper bound.
    pub fn end(&self) -> i64 {
        unpack(self.state.load(Ordering::Acquire)).1
    }

    pub fn start(&self) -> i64 {
        self.start.load(Ordering::Relaxed)
    }

    /// IDs left before exhaustion.
    pub fn idle(&self) -> i64 {
        let (cursor, end) = unpack(self.state.load(Ordering::Acquire));
        (end - cursor).max(0)
    }

    pub fn is_exhausted(&self) -> bool {
        self.idle() == 0
    }

    /// Whether more than `fraction` of the segment has been handed out.
    pub fn consumed_beyond(&self, fraction: f64) -> bool {
        let (cursor, end) = unpack(self.state.load(Ordering::Acquire));
        let len = end - self.start();
        if len <= 0 {
            return true;
        }
        let consumed = (cursor.min(end) - self.start()) as f64;
        consumed > fraction * len as f64
    }
}

impl Default for Segment {
    fn default() -> Self {
        Self::empty()
    }
}

impl core::fmt::Debug for Segment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (cursor, end) = unpack(self.state.load(Ordering::Acquire));
        f.debug_struct("Segment")
            .field("start", &self.start())
            .field("cursor", &cursor)
            .field("end", &end)
            .finish()
    }
}
