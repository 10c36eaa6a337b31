//! Request limits and conversions between allocator state and protocol
//! messages.

use crate::proto::{BufferState, DescribeTagResponse, SegmentState};
use segid::{BufferSnapshot, SegmentSnapshot, TagRecord};

/// Largest `count` accepted by `AllocateIds`.
pub const MAX_BATCH_IDS: u32 = 10_000;

impl From<SegmentSnapshot> for SegmentState {
    fn from(segment: SegmentSnapshot) -> Self {
        Self {
            start: segment.start,
            cursor: segment.cursor,
            end: segment.end,
            idle: segment.idle,
        }
    }
}

impl From<BufferSnapshot> for BufferState {
    fn from(snapshot: BufferSnapshot) -> Self {
        Self {
            initialized: snapshot.initialized,
            current_index: snapshot.current_index as u32,
            next_ready: snapshot.next_ready,
            refill_running: snapshot.refill_running,
            step: snapshot.step,
            segments: snapshot.segments.into_iter().map(Into::into).collect(),
        }
    }
}

/// Builds a `DescribeTag` reply from the persisted row and, if this
/// instance has cached the tag, its buffer.
pub fn describe_tag(record: TagRecord, buffer: Option<BufferSnapshot>) -> DescribeTagResponse {
    DescribeTagResponse {
        tag: record.tag,
        max_id: record.max_id,
        step: record.step,
        updated_at_ms: record.updated_at.timestamp_millis(),
        buffer: buffer.map(Into::into),
    }
}
