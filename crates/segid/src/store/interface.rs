use crate::Result;
use chrono::{DateTime, Utc};

/// Maximum length of a business tag, in bytes.
pub const MAX_TAG_LEN: usize = 128;

/// A contiguous range of IDs `[start, end)` reserved from the store.
///
/// `step` is the tag's configured step at the time of the fetch, which may
/// differ from `end - start` when the range was fetched with a custom step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentRange {
    pub start: i64,
    pub end: i64,
    pub step: u32,
}

impl SegmentRange {
    /// Number of IDs in the range.
    pub const fn len(&self) -> i64 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whether the two ranges share at least one ID.
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One row of the `business_tag` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    pub tag: String,
    pub max_id: i64,
    pub step: u32,
    pub updated_at: DateTime<Utc>,
}

/// Durable source of truth for the next unallocated range of each tag.
///
/// Implementations must advance `max_id` atomically (row lock or
/// compare-and-swap); concurrent fetches, including fetches from other
/// processes, must return pairwise disjoint ranges.
pub trait SegmentStore: Send + Sync + 'static {
    /// Reserves `[max_id, max_id + step)` for `tag` and persists the new
    /// `max_id`.
    ///
    /// # Errors
    /// - [`Error::UnknownTag`] if the tag has no row.
    /// - [`Error::RangeOverflow`] if the new bound overflows `i64`.
    /// - [`Error::StoreUnavailable`] on connectivity or lock failures.
    ///
    /// [`Error::UnknownTag`]: crate::Error::UnknownTag
    /// [`Error::RangeOverflow`]: crate::Error::RangeOverflow
    /// [`Error::StoreUnavailable`]: crate::Error::StoreUnavailable
    fn fetch_next_segment(&self, tag: &str) -> impl Future<Output = Result<SegmentRange>> + Send;

    /// Like [`Self::fetch_next_segment`], but advances by `step` instead of
    /// the tag's configured step. The configured step is left untouched.
    fn fetch_next_segment_with_step(
        &self,
        tag: &str,
        step: u32,
    ) -> impl Future<Output = Result<SegmentRange>> + Send;

    /// Inserts a tag row starting at `start` with the given `step`.
    ///
    /// Registration is idempotent: if the tag already exists its current row
    /// is returned unchanged.
    fn register_tag(
        &self,
        tag: &str,
        start: i64,
        step: u32,
    ) -> impl Future<Output = Result<TagRecord>> + Send;

    /// Returns the row for `tag`, if any.
    fn get_tag(&self, tag: &str) -> impl Future<Output = Result<Option<TagRecord>>> + Send;

    /// Returns every registered tag name.
    fn list_tags(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Rejects tags the store schema cannot hold.
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(crate::Error::invalid("tag must not be empty"));
    }
    if tag.len() > MAX_TAG_LEN {
        return Err(crate::Error::invalid(format!(
            "tag length {} exceeds maximum ({MAX_TAG_LEN})",
            tag.len()
        )));
    }
    Ok(())
}

pub(crate) fn validate_start(start: i64) -> Result<()> {
    if start < 0 {
        return Err(crate::Error::invalid(format!(
            "start {start} must not be negative"
        )));
    }
    Ok(())
}

pub(crate) fn validate_step(step: u32) -> Result<()> {
    if step == 0 || step > i32::MAX as u32 {
        return Err(crate::Error::invalid(format!(
            "step {step} must be in 1..={}",
            i32::MAX
        )));
    }
    Ok(())
}
