use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::FileMetadata;

use crate::MetadataSink;

/// In-memory sink standing in for the document store in tests.
#[derive(Default)]
pub struct MemoryMetadataStore {
    records: Mutex<Vec<(String, FileMetadata)>>,
    fail_paths: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Makes inserts for the given source path fail, for failure-isolation
    /// tests.
    pub fn fail_on_path(&self, path: &str) {
        self.fail_paths.lock().unwrap().insert(path.to_string());
    }

    pub fn records(&self) -> Vec<(String, FileMetadata)> {
        self.records.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataSink for MemoryMetadataStore {
    async fn insert(&self, collection: &str, metadata: &FileMetadata) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("metadata store is closed"));
        }
        if self.fail_paths.lock().unwrap().contains(&metadata.path) {
            return Err(anyhow!("injected insert failure for {}", metadata.path));
        }
        self.records
            .lock()
            .unwrap()
            .push((collection.to_string(), metadata.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
