use crate::{
    Error, Result,
    store::{SegmentRange, SegmentStore, TagRecord, validate_start, validate_step, validate_tag},
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

/// An in-process [`SegmentStore`].
///
/// All rows live behind one mutex, which gives every fetch the same
/// isolation a row lock gives in a relational store. Share it between
/// allocators with an [`Arc`](std::sync::Arc) to model several service
/// instances talking to one database.
#[derive(Debug, Default)]
pub struct MemorySegmentStore {
    rows: Mutex<HashMap<String, TagRecord>>,
}

impl MemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store preloaded with `(tag, max_id, step)` rows.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for an invalid tag or step.
    pub fn with_tags<'a>(tags: impl IntoIterator<Item = (&'a str, i64, u32)>) -> Result<Self> {
        let store = Self::new();
        for (tag, max_id, step) in tags {
            store.insert(tag, max_id, step)?;
        }
        Ok(store)
    }

    /// Inserts a row, or updates an existing one.
    ///
    /// An existing row's `max_id` may only move forward; its step may change
    /// freely.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for an invalid tag or step, or a
    /// `max_id` below the row's current one.
    pub fn insert(&self, tag: &str, max_id: i64, step: u32) -> Result<()> {
        validate_tag(tag)?;
        validate_start(max_id)?;
        validate_step(step)?;
        let mut rows = self.rows.lock();
        if let Some(current) = rows.get(tag).map(|row| row.max_id).filter(|&m| max_id < m) {
            return Err(Error::invalid(format!(
                "max_id {max_id} for `{tag}` is below the current {current}"
            )));
        }
        rows.insert(
            tag.to_owned(),
            TagRecord {
                tag: tag.to_owned(),
                max_id,
                step,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Deletes a row, returning whether it existed.
    pub fn remove(&self, tag: &str) -> bool {
        self.rows.lock().remove(tag).is_some()
    }

    fn advance(&self, tag: &str, step: Option<u32>) -> Result<SegmentRange> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(tag).ok_or_else(|| Error::unknown_tag(tag))?;
        let by = step.unwrap_or(row.step);
        let end = row
            .max_id
            .checked_add(i64::from(by))
            .ok_or_else(|| Error::RangeOverflow {
                tag: tag.to_owned(),
            })?;
        let start = row.max_id;
        row.max_id = end;
        row.updated_at = Utc::now();
        Ok(SegmentRange {
            start,
            end,
            step: row.step,
        })
    }
}

impl SegmentStore for MemorySegmentStore {
    async fn fetch_next_segment(&self, tag: &str) -> Result<SegmentRange> {
        self.advance(tag, None)
    }

    async fn fetch_next_segment_with_step(&self, tag: &str, step: u32) -> Result<SegmentRange> {
        validate_step(step)?;
        self.advance(tag, Some(step))
    }

    async fn register_tag(&self, tag: &str, start: i64, step: u32) -> Result<TagRecord> {
        validate_tag(tag)?;
        validate_start(start)?;
        validate_step(step)?;
        let mut rows = self.rows.lock();
        let row = rows.entry(tag.to_owned()).or_insert_with(|| TagRecord {
            tag: tag.to_owned(),
            max_id: start,
            step,
            updated_at: Utc::now(),
        });
        Ok(row.clone())
    }

    async fn get_tag(&self, tag: &str) -> Result<Option<TagRecord>> {
        Ok(self.rows.lock().get(tag).cloned())
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        let mut tags: Vec<String> = self.rows.lock().keys().cloned().collect();
        tags.sort_unstable();
        Ok(tags)
    }
}
