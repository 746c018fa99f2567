mod memory;
mod postgres;

pub use memory::MemoryMetadataStore;
pub use postgres::{MetadataStoreConfig, PostgresMetadataStore};

use anyhow::Result;
use async_trait::async_trait;
use data_model::FileMetadata;

/// Capability boundary for the document store holding per-file records.
///
/// Implementations are shared behind an `Arc` and must tolerate concurrent
/// callers.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    /// Appends one record to the named collection. Records are never
    /// updated in place; re-ingestion appends new rows.
    async fn insert(&self, collection: &str, metadata: &FileMetadata) -> Result<()>;

    /// Releases the underlying connection. Idempotent, safe to call once at
    /// shutdown.
    async fn close(&self) -> Result<()>;
}
