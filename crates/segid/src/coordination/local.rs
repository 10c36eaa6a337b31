use crate::{Result, coordination::Coordinator};
use core::time::Duration;
use parking_lot::Mutex;
use std::{sync::Arc, time::Instant};

#[derive(Debug, Default)]
struct State {
    lease: Option<Lease>,
    snapshot: Option<Vec<String>>,
}

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

/// An in-process [`Coordinator`].
///
/// Clones share one lease and one snapshot, so several allocators in the
/// same process (or a test standing in for several hosts) see each other.
#[derive(Debug, Clone, Default)]
pub struct LocalCoordinator {
    state: Arc<Mutex<State>>,
}

impl LocalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lease holder, ignoring expired leases.
    pub fn leader(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .lease
            .as_ref()
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.holder.clone())
    }

    /// Gives up the lease if `instance_id` holds it.
    pub fn release(&self, instance_id: &str) -> bool {
        let mut state = self.state.lock();
        match &state.lease {
            Some(lease) if lease.holder == instance_id => {
                state.lease = None;
                true
            }
            _ => false,
        }
    }
}

impl Coordinator for LocalCoordinator {
    async fn try_acquire_leadership(&self, instance_id: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let available = match &state.lease {
            None => true,
            Some(lease) => lease.holder == instance_id || lease.expires_at <= now,
        };
        if available {
            state.lease = Some(Lease {
                holder: instance_id.to_owned(),
                expires_at: now + ttl,
            });
        }
        Ok(available)
    }

    async fn publish_snapshot(&self, tags: &[String]) -> Result<()> {
        self.state.lock().snapshot = Some(tags.to_vec());
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<Vec<String>>> {
        Ok(self.state.lock().snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn one_leader_at_a_time() -> Result<()> {
        let a = LocalCoordinator::new();
        let b = a.clone();

        assert!(a.try_acquire_leadership("a", TTL).await?);
        assert!(!b.try_acquire_leadership("b", TTL).await?);
        // Renewal by the holder.
        assert!(a.try_acquire_leadership("a", TTL).await?);
        assert_eq!(b.leader().as_deref(), Some("a"));
        Ok(())
    }

    #[tokio::test]
    async fn expired_leases_can_be_taken() -> Result<()> {
        let coordinator = LocalCoordinator::new();
        assert!(
            coordinator
                .try_acquire_leadership("a", Duration::from_millis(10))
                .await?
        );
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(coordinator.leader(), None);
        assert!(coordinator.try_acquire_leadership("b", TTL).await?);
        assert_eq!(coordinator.leader().as_deref(), Some("b"));
        Ok(())
    }

    #[tokio::test]
    async fn release_only_by_the_holder() -> Result<()> {
        let coordinator = LocalCoordinator::new();
        coordinator.try_acquire_leadership("a", TTL).await?;

        assert!(!coordinator.release("b"));
        assert!(coordinator.release("a"));
        assert!(coordinator.try_acquire_leadership("b", TTL).await?);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_is_shared_between_clones() -> Result<()> {
        let publisher = LocalCoordinator::new();
        let reader = publisher.clone();
        assert_eq!(reader.load_snapshot().await?, None);

        publisher
            .publish_snapshot(&["a".to_owned(), "b".to_owned()])
            .await?;
        assert_eq!(
            reader.load_snapshot().await?,
            Some(vec!["a".to_owned(), "b".to_owned()])
        );
        Ok(())
    }
}
