//! The store behind the service, chosen at start-up.

use crate::server::config::{ServerConfig, StoreBackend};
use segid_tonic_core::segid::{
    MemorySegmentStore, Result, SegmentRange, SegmentStore, TagRecord,
};
#[cfg(feature = "postgres")]
use segid_tonic_core::segid::PgSegmentStore;

/// Either of the bundled [`SegmentStore`]s.
#[derive(Debug)]
pub enum AnyStore {
    Memory(MemorySegmentStore),
    #[cfg(feature = "postgres")]
    Postgres(PgSegmentStore),
}

impl AnyStore {
    /// Opens the configured backend and registers the seed tags.
    pub async fn open(config: &ServerConfig) -> anyhow::Result<Self> {
        let store = match &config.backend {
            StoreBackend::Memory => Self::Memory(MemorySegmentStore::new()),
            #[cfg(feature = "postgres")]
            StoreBackend::Postgres {
                url,
                max_connections,
            } => {
                let store = PgSegmentStore::connect(url, *max_connections).await?;
                store.migrate().await?;
                Self::Postgres(store)
            }
            #[cfg(not(feature = "postgres"))]
            StoreBackend::Postgres { .. } => {
                anyhow::bail!("this build lacks the `postgres` feature")
            }
        };

        for seed in &config.seed_tags {
            let _record = store.register_tag(&seed.tag, seed.max_id, seed.step).await?;
            #[cfg(feature = "tracing")]
            tracing::info!(
                tag = _record.tag,
                max_id = _record.max_id,
                step = _record.step,
                "Seeded tag"
            );
        }
        Ok(store)
    }
}

impl SegmentStore for AnyStore {
    async fn fetch_next_segment(&self, tag: &str) -> Result<SegmentRange> {
        match self {
            Self::Memory(store) => store.fetch_next_segment(tag).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(store) => store.fetch_next_segment(tag).await,
        }
    }

    async fn fetch_next_segment_with_step(&self, tag: &str, step: u32) -> Result<SegmentRange> {
        match self {
            Self::Memory(store) => store.fetch_next_segment_with_step(tag, step).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(store) => store.fetch_next_segment_with_step(tag, step).await,
        }
    }

    async fn register_tag(&self, tag: &str, start: i64, step: u32) -> Result<TagRecord> {
        match self {
            Self::Memory(store) => store.register_tag(tag, start, step).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(store) => store.register_tag(tag, start, step).await,
        }
    }

    async fn get_tag(&self, tag: &str) -> Result<Option<TagRecord>> {
        match self {
            Self::Memory(store) => store.get_tag(tag).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(store) => store.get_tag(tag).await,
        }
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        match self {
            Self::Memory(store) => store.list_tags().await,
            #[cfg(feature = "postgres")]
            Self::Postgres(store) => store.list_tags().await,
        }
    }
}
