use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use metadata_store::MetadataStoreConfig;
use serde::{Deserialize, Serialize};

fn default_collection() -> String {
    "default".to_string()
}

fn default_upload_concurrency() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Root of the tree to ingest.
    pub root: PathBuf,
    /// Collection every record of this run is written to.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Upper bound on concurrent blob uploads.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scan: ScanConfig,
    pub blob_storage: BlobStorageConfig,
    pub metadata_store: MetadataStoreConfig,
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Config> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = Figment::new()
            .merge(Toml::string(&config_str))
            .extract()
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from the conventional locations when no --config flag is given.
    pub fn search() -> Result<Config> {
        let mut candidates = Vec::new();
        if let Some(home) = std::env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".filehaven/filehaven.toml"));
        }
        candidates.push(PathBuf::from("/etc/filehaven.toml"));
        for candidate in &candidates {
            if candidate.exists() {
                return Self::from_path(candidate);
            }
        }
        Err(anyhow!("no config file found (searched {:?})", candidates))
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan.root.as_os_str().is_empty() {
            return Err(anyhow!("scan root must not be empty"));
        }
        if self.scan.upload_concurrency == 0 {
            return Err(anyhow!("upload_concurrency must be at least 1"));
        }
        if self.blob_storage.path.starts_with("s3://") && self.blob_storage.s3.is_none() {
            return Err(anyhow!(
                "s3 blob storage requires [blob_storage.s3] credentials"
            ));
        }
        Ok(())
    }
}
