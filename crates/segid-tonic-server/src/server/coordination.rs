//! The coordinator behind maintenance, chosen to match the store.

use crate::server::store::AnyStore;
use core::time::Duration;
#[cfg(feature = "postgres")]
use segid_tonic_core::segid::PgCoordinator;
use segid_tonic_core::segid::{Coordinator, LocalCoordinator, Result};

/// Either of the bundled [`Coordinator`]s.
///
/// A Postgres store shares its database with a [`PgCoordinator`], so every
/// instance on that database elects one maintenance leader. The in-memory
/// store has no other instances to coordinate with.
#[derive(Debug, Clone)]
pub enum AnyCoordinator {
    Local(LocalCoordinator),
    #[cfg(feature = "postgres")]
    Postgres(PgCoordinator),
}

impl AnyCoordinator {
    /// Builds the coordinator for `store`, creating its tables if needed.
    pub async fn for_store(store: &AnyStore) -> anyhow::Result<Self> {
        match store {
            AnyStore::Memory(_) => Ok(Self::Local(LocalCoordinator::new())),
            #[cfg(feature = "postgres")]
            AnyStore::Postgres(store) => {
                let coordinator = PgCoordinator::new(store.pool().clone());
                coordinator.migrate().await?;
                Ok(Self::Postgres(coordinator))
            }
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => "postgres",
        }
    }
}

impl Coordinator for AnyCoordinator {
    async fn try_acquire_leadership(&self, instance_id: &str, ttl: Duration) -> Result<bool> {
        match self {
            Self::Local(c) => c.try_acquire_leadership(instance_id, ttl).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(c) => c.try_acquire_leadership(instance_id, ttl).await,
        }
    }

    async fn publish_snapshot(&self, tags: &[String]) -> Result<()> {
        match self {
            Self::Local(c) => c.publish_snapshot(tags).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(c) => c.publish_snapshot(tags).await,
        }
    }

    async fn load_snapshot(&self) -> Result<Option<Vec<String>>> {
        match self {
            Self::Local(c) => c.load_snapshot().await,
            #[cfg(feature = "postgres")]
            Self::Postgres(c) => c.load_snapshot().await,
        }
    }
}
