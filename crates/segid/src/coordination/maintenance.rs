//! Periodic upkeep for a [`SegmentAllocator`].
//!
//! Every instance synchronises its tag cache with the store on each tick.
//! Whichever instance holds the coordinator lease also publishes the store's
//! tag list, which freshly started instances use to warm up
//! ([`SegmentAllocator::warm_up_from`]).

use crate::{
    SegmentAllocator, TagSync,
    coordination::Coordinator,
    store::SegmentStore,
};
use core::time::Duration;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// What one maintenance tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// `None` if the store could not be read.
    pub sync: Option<TagSync>,
    pub leader: bool,
    /// Number of tags published, if this instance published.
    pub published: Option<usize>,
}

/// Drives tag synchronisation and snapshot publishing.
pub struct Maintenance<S: SegmentStore, C: Coordinator> {
    allocator: Arc<SegmentAllocator<S>>,
    coordinator: Arc<C>,
    instance_id: String,
    interval: Duration,
    lease_ttl: Duration,
}

impl<S: SegmentStore, C: Coordinator> Maintenance<S, C> {
    /// Ticks every [`DEFAULT_MAINTENANCE_INTERVAL`], with a lease lasting
    /// three ticks.
    pub fn new(
        allocator: Arc<SegmentAllocator<S>>,
        coordinator: Arc<C>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            allocator,
            coordinator,
            instance_id: instance_id.into(),
            interval: DEFAULT_MAINTENANCE_INTERVAL,
            lease_ttl: DEFAULT_MAINTENANCE_INTERVAL * 3,
        }
    }

    /// Sets the tick interval; the lease TTL follows at three ticks.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self.lease_ttl = interval * 3;
        self
    }

    #[must_use]
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Runs one tick. Never fails: store and coordinator errors are logged
    /// and reflected in the report.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self), fields(instance = %self.instance_id)))]
    pub async fn run_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            sync: self
                .allocator
                .sync_tags()
                .await
                .inspect_err(|_e| {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_e, "Tag sync failed");
                })
                .ok(),
            ..MaintenanceReport::default()
        };

        report.leader = match self
            .coordinator
            .try_acquire_leadership(&self.instance_id, self.lease_ttl)
            .await
        {
            Ok(leader) => leader,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_e, "Leadership check failed");
                false
            }
        };
        if !report.leader {
            return report;
        }

        let tags = match self.allocator.store().list_tags().await {
            Ok(tags) => tags,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_e, "Cannot list tags for snapshot");
                return report;
            }
        };
        match self.coordinator.publish_snapshot(&tags).await {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(tags = tags.len(), "Published tag snapshot");
                report.published = Some(tags.len());
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_e, "Snapshot publish failed");
            }
        }
        report
    }

    /// Ticks until `shutdown` is cancelled. The first tick runs immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        #[cfg(feature = "tracing")]
        tracing::info!(
            instance = %self.instance_id,
            interval = ?self.interval,
            "Maintenance loop started"
        );

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!(instance = %self.instance_id, "Maintenance loop stopped");
    }
}
