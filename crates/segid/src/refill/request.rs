use crate::{Result, segment::SegmentBuffer};
use std::sync::Arc;
use tokio::sync::oneshot;

/// A message sent from the [`RefillPool`] to one of its workers.
///
/// [`RefillPool`]: crate::refill::RefillPool
#[derive(Debug)]
pub enum RefillRequest {
    /// Fetch the next segment for `buffer` into its standby slot.
    ///
    /// The sender must hold the buffer's single-flight refill flag; the
    /// worker releases it when done. `done`, if present, receives the
    /// outcome.
    Fill {
        buffer: Arc<SegmentBuffer>,
        done: Option<oneshot::Sender<Result<()>>>,
    },

    /// Stop the worker. `response` is acknowledged once the loop exits.
    Shutdown { response: oneshot::Sender<()> },
}
