//! Postgres-backed [`SegmentStore`].
//!
//! Each reservation is a single `UPDATE ... RETURNING` statement, so the row
//! lock on `business_tag` is held for exactly one statement and concurrent
//! instances serialize on it without a read-then-write window.

use crate::{
    Error, Result,
    store::{SegmentRange, SegmentStore, TagRecord, validate_start, validate_step, validate_tag},
};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, postgres::PgPoolOptions};

const CREATE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS business_tag (
    tag         VARCHAR(128) PRIMARY KEY,
    max_id      BIGINT       NOT NULL DEFAULT 0,
    step        INTEGER      NOT NULL CHECK (step > 0),
    updated_at  TIMESTAMPTZ  NOT NULL DEFAULT now()
)";

const ADVANCE_BY_STEP: &str = r"
UPDATE business_tag
   SET max_id = max_id + step, updated_at = now()
 WHERE tag = $1
RETURNING max_id, step";

const ADVANCE_BY_CUSTOM_STEP: &str = r"
UPDATE business_tag
   SET max_id = max_id + $2, updated_at = now()
 WHERE tag = $1
RETURNING max_id, step";

const INSERT_TAG: &str = r"
INSERT INTO business_tag (tag, max_id, step)
VALUES ($1, $2, $3)
ON CONFLICT (tag) DO NOTHING";

const SELECT_TAG: &str = r"
SELECT tag, max_id, step, updated_at FROM business_tag WHERE tag = $1";

const SELECT_TAGS: &str = r"SELECT tag FROM business_tag ORDER BY tag";

type Row = (String, i64, i32, DateTime<Utc>);

/// A [`SegmentStore`] persisting rows in the `business_tag` table.
#[derive(Debug, Clone)]
pub struct PgSegmentStore {
    pool: PgPool,
}

impl PgSegmentStore {
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool with at most `max_connections` connections.
    ///
    /// # Errors
    /// Returns [`Error::StoreUnavailable`] if the database is unreachable.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// The connection pool, for sharing with a
    /// [`PgCoordinator`](crate::PgCoordinator).
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the `business_tag` table if it does not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    async fn advance(&self, tag: &str, step: Option<u32>) -> Result<SegmentRange> {
        let query = match step {
            Some(step) => sqlx::query_as::<_, (i64, i32)>(ADVANCE_BY_CUSTOM_STEP)
                .bind(tag)
                .bind(i64::from(step)),
            None => sqlx::query_as::<_, (i64, i32)>(ADVANCE_BY_STEP).bind(tag),
        };

        let (end, configured) = match query.fetch_optional(&self.pool).await {
            Ok(Some(row)) => row,
            Ok(None) => return Err(Error::unknown_tag(tag)),
            // `bigint out of range` (SQLSTATE 22003): the row did not move.
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("22003") => {
                return Err(Error::RangeOverflow {
                    tag: tag.to_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let by = step.map_or(i64::from(configured), i64::from);
        Ok(SegmentRange {
            start: end - by,
            end,
            step: u32::try_from(configured)
                .map_err(|_| Error::store_unavailable(format!("corrupt step for `{tag}`")))?,
        })
    }
}

fn to_record((tag, max_id, step, updated_at): Row) -> Result<TagRecord> {
    let step = u32::try_from(step)
        .map_err(|_| Error::store_unavailable(format!("corrupt step for `{tag}`")))?;
    Ok(TagRecord {
        tag,
        max_id,
        step,
        updated_at,
    })
}

impl SegmentStore for PgSegmentStore {
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self)))]
    async fn fetch_next_segment(&self, tag: &str) -> Result<SegmentRange> {
        self.advance(tag, None).await
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self)))]
    async fn fetch_next_segment_with_step(&self, tag: &str, step: u32) -> Result<SegmentRange> {
        validate_step(step)?;
        self.advance(tag, Some(step)).await
    }

    async fn register_tag(&self, tag: &str, start: i64, step: u32) -> Result<TagRecord> {
        validate_tag(tag)?;
        validate_start(start)?;
        validate_step(step)?;
        sqlx::query(INSERT_TAG)
            .bind(tag)
            .bind(start)
            .bind(step as i32)
            .execute(&self.pool)
            .await?;
        self.get_tag(tag)
            .await?
            .ok_or_else(|| Error::store_unavailable(format!("`{tag}` vanished after insert")))
    }

    async fn get_tag(&self, tag: &str) -> Result<Option<TagRecord>> {
        sqlx::query_as::<_, Row>(SELECT_TAG)
            .bind(tag)
            .fetch_optional(&self.pool)
            .await?
            .map(to_record)
            .transpose()
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        let tags = sqlx::query_scalar::<_, String>(SELECT_TAGS)
            .fetch_all(&self.pool)
            .await?;
        Ok(tags)
    }
}
