use std::sync::Arc;

use anyhow::{Context, Result};
use blob_store::BlobStorage;
use metadata_store::{MetadataSink, PostgresMetadataStore};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::{
    config::Config,
    pipeline::{IngestReport, Pipeline},
    scanner::{self, SCAN_CHANNEL_CAPACITY},
};

pub struct Service {
    pub config: Config,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub blob_storage: Arc<BlobStorage>,
    pub metadata_sink: Arc<dyn MetadataSink>,
}

impl Service {
    pub async fn new(config: Config) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let blob_storage = Arc::new(
            BlobStorage::new(&config.blob_storage).context("error initializing blob storage")?,
        );
        let metadata_sink: Arc<dyn MetadataSink> = Arc::new(
            PostgresMetadataStore::new(&config.metadata_store)
                .await
                .context("error connecting to metadata store")?,
        );
        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            blob_storage,
            metadata_sink,
        })
    }

    pub async fn start(self) -> Result<IngestReport> {
        info!(
            root = %self.config.scan.root.display(),
            collection = %self.config.scan.collection,
            "starting ingestion"
        );
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(shutdown_tx).await;
        });

        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let root = self.config.scan.root.clone();
        let scan_task = tokio::spawn(async move { scanner::scan_tree(&root, tx).await });

        let pipeline = Pipeline::new(
            self.config.scan.collection.clone(),
            self.config.scan.upload_concurrency,
            self.blob_storage.clone(),
            self.metadata_sink.clone(),
        );
        let mut report = pipeline.run(rx, self.shutdown_rx.clone()).await?;

        let scan_result = scan_task.await.context("joining scan task")?;
        match &scan_result {
            Ok(summary) => report.files_skipped = summary.skipped,
            Err(e) => error!("scan failed: {:#}", e),
        }

        if let Err(e) = self.metadata_sink.close().await {
            error!("error closing metadata store: {:#}", e);
        }

        info!(
            records_received = report.records_received,
            persisted = report.persisted,
            persist_failed = report.persist_failed,
            uploaded = report.uploaded,
            upload_failed = report.upload_failed,
            files_skipped = report.files_skipped,
            "ingestion finished"
        );
        scan_result.map(|_| report)
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {
            let _ = shutdown_tx.send(());
        },
        _ = terminate => {
            let _ = shutdown_tx.send(());
        },
    }
    info!("signal received, shutting down");
}
