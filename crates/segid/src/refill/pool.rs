//! Background workers that load standby segments.
//!
//! [`RefillPool`] owns a fixed set of tokio tasks, each draining its own
//! queue of [`RefillRequest`]s. Requests are handed out round-robin. Queues
//! are unbounded: a request is only sent by the caller that won a buffer's
//! single-flight flag, so at most one request per tag is ever queued.

use crate::{
    AllocatorConfig, Error, Result,
    refill::{RefillRequest, worker_loop},
    store::SegmentStore,
};
use core::time::Duration;
use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// A pool of refill workers sharing one store.
pub struct RefillPool {
    workers: Vec<mpsc::UnboundedSender<RefillRequest>>,
    next_worker: AtomicUsize,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl RefillPool {
    /// Spawns `config.refill_workers` workers on the current tokio runtime.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn spawn<S: SegmentStore>(store: Arc<S>, config: Arc<AllocatorConfig>) -> Self {
        let workers = (0..config.refill_workers.max(1))
            .map(|worker_id| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(worker_loop(
                    worker_id,
                    rx,
                    Arc::clone(&store),
                    Arc::clone(&config),
                ));
                tx
            })
            .collect();

        #[cfg(feature = "tracing")]
        tracing::debug!("Spawned {} refill workers", config.refill_workers.max(1));

        Self {
            workers,
            next_worker: AtomicUsize::new(0),
            shutdown_token: CancellationToken::new(),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Returns the index of the next worker to receive work (round-robin).
    pub fn next_worker_index(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Queues `request` on the next worker. Never blocks.
    ///
    /// # Errors
    /// Returns [`Error::ServiceShutdown`] once [`shutdown`](Self::shutdown)
    /// has started or if the worker has exited.
    pub fn submit(&self, request: RefillRequest) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ServiceShutdown);
        }

        let worker_idx = self.next_worker_index();
        self.workers[worker_idx].send(request).map_err(|_| {
            #[cfg(feature = "tracing")]
            tracing::error!("Refill worker {worker_idx} channel closed");
            Error::ServiceShutdown
        })
    }

    /// Stops every worker.
    ///
    /// New submissions are refused immediately. Requests already queued are
    /// finished first; each worker then has `shutdown_timeout` to
    /// acknowledge.
    pub async fn shutdown(&self) {
        if self.shutdown_token.is_cancelled() {
            return;
        }
        self.shutdown_token.cancel();

        #[cfg(feature = "tracing")]
        tracing::debug!("Notifying all refill workers to shut down");

        let mut shutdown_handles = Vec::with_capacity(self.workers.len());
        for (i, worker) in self.workers.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            if worker.send(RefillRequest::Shutdown { response: tx }).is_ok() {
                shutdown_handles.push((i, rx));
            } else {
                #[cfg(feature = "tracing")]
                tracing::warn!("Refill worker {i} already stopped");
            }
        }

        let wait = self.shutdown_timeout;
        let acks = shutdown_handles.into_iter().map(|(_i, rx)| async move {
            match timeout(wait, rx).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Refill worker {_i} shutdown acknowledged");
                }
                Ok(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Refill worker {_i} dropped its acknowledgement: {_e}");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Refill worker {_i} shutdown timed out");
                }
            }
        });
        futures::future::join_all(acks).await;

        #[cfg(feature = "tracing")]
        tracing::info!("Refill pool shutdown complete");
    }
}

impl core::fmt::Debug for RefillPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RefillPool")
            .field("workers", &self.workers.len())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
