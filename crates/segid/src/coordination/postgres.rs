//! Postgres-backed [`Coordinator`].
//!
//! The lease and the snapshot are single rows judged against the database's
//! clock, so instances with skewed clocks still agree on who leads.

use crate::{Error, Result, coordination::Coordinator};
use core::time::Duration;
use sqlx::PgPool;

const CREATE_LEASE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS segid_lease (
    name        VARCHAR(64)  PRIMARY KEY,
    holder      VARCHAR(256) NOT NULL,
    expires_at  TIMESTAMPTZ  NOT NULL
)";

const CREATE_SNAPSHOT_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS segid_snapshot (
    name          VARCHAR(64) PRIMARY KEY,
    tags          TEXT[]      NOT NULL,
    published_at  TIMESTAMPTZ NOT NULL DEFAULT now()
)";

// Takes a free or lapsed lease, or renews our own. No row comes back while
// another holder's lease is live.
const ACQUIRE_LEASE: &str = r"
INSERT INTO segid_lease (name, holder, expires_at)
VALUES ($1, $2, now() + make_interval(secs => $3))
ON CONFLICT (name) DO UPDATE
   SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
 WHERE segid_lease.holder = EXCLUDED.holder
    OR segid_lease.expires_at <= now()
RETURNING holder";

const PUBLISH_SNAPSHOT: &str = r"
INSERT INTO segid_snapshot (name, tags)
VALUES ($1, $2)
ON CONFLICT (name) DO UPDATE
   SET tags = EXCLUDED.tags, published_at = now()";

const SELECT_SNAPSHOT: &str = r"SELECT tags FROM segid_snapshot WHERE name = $1";

/// Name of the lease and snapshot rows unless overridden.
pub const DEFAULT_COORDINATION_GROUP: &str = "segid";

/// A [`Coordinator`] storing its lease and snapshot in Postgres.
///
/// Instances pointed at the same database and group elect one maintenance
/// leader between them.
#[derive(Debug, Clone)]
pub struct PgCoordinator {
    pool: PgPool,
    group: String,
}

fn unavailable(err: sqlx::Error) -> Error {
    Error::CoordinationUnavailable {
        reason: err.to_string(),
    }
}

impl PgCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            group: DEFAULT_COORDINATION_GROUP.to_owned(),
        }
    }

    /// Uses separate lease and snapshot rows for `group`, so unrelated
    /// clusters can share a database.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Creates the lease and snapshot tables if they do not exist.
    ///
    /// # Errors
    /// Returns [`Error::CoordinationUnavailable`] if the database is
    /// unreachable.
    pub async fn migrate(&self) -> Result<()> {
        for ddl in [CREATE_LEASE_TABLE, CREATE_SNAPSHOT_TABLE] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
        }
        Ok(())
    }
}

impl Coordinator for PgCoordinator {
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self), fields(group = %self.group)))]
    async fn try_acquire_leadership(&self, instance_id: &str, ttl: Duration) -> Result<bool> {
        let holder = sqlx::query_scalar::<_, String>(ACQUIRE_LEASE)
            .bind(&self.group)
            .bind(instance_id)
            .bind(ttl.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(holder.is_some())
    }

    async fn publish_snapshot(&self, tags: &[String]) -> Result<()> {
        sqlx::query(PUBLISH_SNAPSHOT)
            .bind(&self.group)
            .bind(tags)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<Vec<String>>> {
        sqlx::query_scalar::<_, Vec<String>>(SELECT_SNAPSHOT)
            .bind(&self.group)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)
    }
}
