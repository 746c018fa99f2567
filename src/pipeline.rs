use std::{sync::Arc, time::Duration};

use anyhow::Result;
use blob_store::BlobStorage;
use data_model::{FileMetadata, HASH_ALGORITHM};
use metadata_store::MetadataSink;
use tokio::{
    sync::{mpsc, watch, Semaphore},
    task::JoinSet,
};
use tracing::{error, info, warn};

const UPLOAD_ATTEMPTS: u32 = 3;
const UPLOAD_BACKOFF: Duration = Duration::from_millis(500);

/// Tally of one ingestion run, logged at exit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub records_received: u64,
    pub persisted: u64,
    pub persist_failed: u64,
    pub uploaded: u64,
    pub upload_failed: u64,
    pub files_skipped: u64,
}

/// Consumes scanned records: persists each one to the metadata store, then
/// uploads its content under the content-derived key. Uploads run
/// concurrently up to a configured bound; a failure on one file never stops
/// the others.
pub struct Pipeline {
    collection: String,
    blob_storage: Arc<BlobStorage>,
    metadata_sink: Arc<dyn MetadataSink>,
    upload_slots: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(
        collection: String,
        upload_concurrency: usize,
        blob_storage: Arc<BlobStorage>,
        metadata_sink: Arc<dyn MetadataSink>,
    ) -> Self {
        Self {
            collection,
            blob_storage,
            metadata_sink,
            upload_slots: Arc::new(Semaphore::new(upload_concurrency)),
        }
    }

    /// Runs until the producer drops its sender or shutdown is signalled,
    /// then drains every in-flight upload before returning.
    pub async fn run(
        &self,
        mut records: mpsc::Receiver<FileMetadata>,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let mut uploads: JoinSet<bool> = JoinSet::new();
        // Separate handle so the wait for an upload slot can also watch for
        // shutdown.
        let mut slot_shutdown_rx = shutdown_rx.clone();
        loop {
            tokio::select! {
                record = records.recv() => {
                    let Some(record) = record else {
                        break;
                    };
                    report.records_received += 1;
                    if !self
                        .handle_record(record, &mut uploads, &mut report, &mut slot_shutdown_rx)
                        .await?
                    {
                        info!("shutdown signal received, stopping intake");
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    info!("shutdown signal received, stopping intake");
                    break;
                },
            }
            // Tally uploads opportunistically so the set doesn't grow
            // unbounded on long scans.
            while let Some(outcome) = uploads.try_join_next() {
                tally_upload(outcome, &mut report);
            }
        }
        // Closing the receiver makes a blocked producer bail out instead of
        // waiting on a send that will never complete.
        records.close();
        while let Some(outcome) = uploads.join_next().await {
            tally_upload(outcome, &mut report);
        }
        Ok(report)
    }

    /// Persists one record and dispatches its upload. Returns `false` when
    /// shutdown arrived while waiting for an upload slot.
    async fn handle_record(
        &self,
        record: FileMetadata,
        uploads: &mut JoinSet<bool>,
        report: &mut IngestReport,
        shutdown_rx: &mut watch::Receiver<()>,
    ) -> Result<bool> {
        info!(path = %record.path, hash = %record.hash, "ingesting file");
        if let Err(e) = self.metadata_sink.insert(&self.collection, &record).await {
            error!(path = %record.path, "failed to persist metadata: {:#}", e);
            report.persist_failed += 1;
            return Ok(true);
        }
        report.persisted += 1;

        // A full upload queue must not make the coordinator deaf to the
        // shutdown signal.
        let permit = tokio::select! {
            permit = self.upload_slots.clone().acquire_owned() => permit?,
            _ = shutdown_rx.changed() => return Ok(false),
        };
        let blob_storage = self.blob_storage.clone();
        uploads.spawn(async move {
            let _permit = permit;
            upload_blob(&blob_storage, &record).await
        });
        Ok(true)
    }
}

fn tally_upload(outcome: Result<bool, tokio::task::JoinError>, report: &mut IngestReport) {
    match outcome {
        Ok(true) => report.uploaded += 1,
        Ok(false) => report.upload_failed += 1,
        Err(e) => {
            error!("upload task panicked: {:?}", e);
            report.upload_failed += 1;
        }
    }
}

/// Uploads one file under its content hash, retrying transient failures.
/// Returns whether the blob made it to the store.
async fn upload_blob(blob_storage: &BlobStorage, record: &FileMetadata) -> bool {
    for attempt in 1..=UPLOAD_ATTEMPTS {
        match blob_storage.put_file(&record.hash, &record.path).await {
            Ok(res) => {
                let observed = format!("{}:{}", HASH_ALGORITHM, res.sha256_hash);
                if observed != record.hash {
                    // The file changed between fingerprinting and upload. The
                    // stored blob no longer matches its key.
                    warn!(
                        path = %record.path,
                        expected = %record.hash,
                        observed = %observed,
                        "content changed during upload"
                    );
                }
                info!(path = %record.path, key = %record.hash, "uploaded blob");
                return true;
            }
            Err(e) => {
                warn!(
                    path = %record.path,
                    attempt = attempt,
                    "blob upload failed: {:#}",
                    e
                );
                if attempt < UPLOAD_ATTEMPTS {
                    tokio::time::sleep(UPLOAD_BACKOFF * 2u32.pow(attempt - 1)).await;
                }
            }
        }
    }
    error!(path = %record.path, key = %record.hash, "giving up on blob upload");
    false
}
