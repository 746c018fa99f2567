use anyhow::{Context, Result};
use async_trait::async_trait;
use data_model::FileMetadata;
use serde::{Deserialize, Serialize};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    types::Json,
    PgPool,
};
use tracing::info;

use crate::MetadataSink;

/// All deployments write into the same database; collections are rows, not
/// schemas.
const DATABASE_NAME: &str = "filehaven";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS file_metadata (
    id BIGSERIAL PRIMARY KEY,
    collection TEXT NOT NULL,
    document JSONB NOT NULL,
    inserted_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_file_metadata_collection ON file_metadata (collection);
"#;

fn default_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataStoreConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Document store backed by PostgreSQL. Each record lands as one JSONB row
/// tagged with its collection.
pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    pub async fn new(config: &MetadataStoreConfig) -> Result<Self> {
        let opts = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(DATABASE_NAME);

        info!(
            host = %config.host,
            port = config.port,
            user = %config.user,
            "connecting to metadata store"
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(opts)
            .await
            .context("connecting to metadata store")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared
        // statement, so the schema is split and executed statement by
        // statement.
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("applying metadata schema")?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataSink for PostgresMetadataStore {
    async fn insert(&self, collection: &str, metadata: &FileMetadata) -> Result<()> {
        sqlx::query("INSERT INTO file_metadata (collection, document) VALUES ($1, $2)")
            .bind(collection)
            .bind(Json(metadata))
            .execute(&self.pool)
            .await
            .with_context(|| format!("inserting metadata for {}", metadata.path))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.pool.is_closed() {
            self.pool.close().await;
        }
        Ok(())
    }
}
