//! Batch uploading of queue entries and catalog objects.
//!
//! `BatchRunner` splits its input into fixed-size batches and hands each one to
//! an [`Uploader`]. Queue runs commit the processed flag of every successful
//! batch before starting the next one; the first failing batch stops the run
//! and leaves it and every later batch unprocessed. Initial exports never touch
//! the queue.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{error, info, instrument};

use crate::db;
use crate::model::{LiveObject, QueueEntry};

/// One batch handed to an uploader.
#[derive(Debug, Clone, Copy)]
pub enum Batch<'a> {
    Queued(&'a [QueueEntry]),
    Initial(&'a [LiveObject]),
}

impl Batch<'_> {
    pub fn from_queue(&self) -> bool {
        matches!(self, Batch::Queued(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Batch::Queued(entries) => entries.len(),
            Batch::Initial(objects) => objects.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait Uploader: Send + Sync {
    fn name(&self) -> &str;

    async fn upload_records(&self, batch: Batch<'_>) -> Result<()>;
}

/// Persists the processed flag of queue entries. Each call is one commit.
#[async_trait]
pub trait ProcessedStore: Send + Sync {
    async fn commit_processed(&self, ids: &[i64]) -> Result<()>;
}

#[async_trait]
impl ProcessedStore for SqlitePool {
    async fn commit_processed(&self, ids: &[i64]) -> Result<()> {
        db::mark_processed(self, ids).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSizes {
    pub batch_size: usize,
    pub initial_batch_size: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self {
            batch_size: 100,
            initial_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Batches handed to the uploader, including a failed one.
    pub batches: usize,
    /// Records in batches that uploaded successfully.
    pub uploaded: usize,
    /// Queue entries flagged processed and committed.
    pub processed: usize,
    /// 1-based index of the batch that failed.
    pub failed_batch: Option<usize>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failed_batch.is_none() && self.error.is_none()
    }
}

pub struct BatchRunner<'a> {
    uploader: &'a dyn Uploader,
    sizes: BatchSizes,
}

impl<'a> BatchRunner<'a> {
    pub fn new(uploader: &'a dyn Uploader, sizes: BatchSizes) -> Self {
        Self { uploader, sizes }
    }

    /// Upload queued entries batch by batch, committing each successful batch
    /// before the next one starts. Upload errors end the run and are reported;
    /// errors from `store` are returned.
    #[instrument(skip_all, fields(uploader = self.uploader.name(), entries = entries.len()))]
    pub async fn run(
        &self,
        store: &dyn ProcessedStore,
        entries: &mut [QueueEntry],
    ) -> Result<RunReport> {
        let mut report = RunReport::default();
        for (idx, chunk) in entries.chunks_mut(self.sizes.batch_size.max(1)).enumerate() {
            let n = idx + 1;
            report.batches += 1;
            if let Err(err) = self.uploader.upload_records(Batch::Queued(&*chunk)).await {
                error!(?err, batch = n, size = chunk.len(), "batch upload failed; stopping run");
                report.failed_batch = Some(n);
                report.error = Some(format!("{:#}", err));
                break;
            }
            report.uploaded += chunk.len();

            let ids: Vec<i64> = chunk.iter().map(|e| e.id).collect();
            store
                .commit_processed(&ids)
                .await
                .with_context(|| format!("failed to commit batch {}", n))?;
            for entry in chunk.iter_mut() {
                entry.processed = true;
            }
            report.processed += chunk.len();
            info!(batch = n, size = chunk.len(), "batch uploaded and committed");
        }
        Ok(report)
    }

    /// Upload every object without touching the queue. The first failing
    /// batch aborts the export.
    #[instrument(skip_all, fields(uploader = self.uploader.name(), objects = objects.len()))]
    pub async fn run_initial(&self, objects: &[LiveObject]) -> Result<RunReport> {
        let mut report = RunReport::default();
        for (idx, chunk) in objects
            .chunks(self.sizes.initial_batch_size.max(1))
            .enumerate()
        {
            let n = idx + 1;
            report.batches += 1;
            self.uploader
                .upload_records(Batch::Initial(chunk))
                .await
                .with_context(|| format!("initial export batch {} failed", n))?;
            report.uploaded += chunk.len();
            info!(batch = n, size = chunk.len(), "initial batch uploaded");
        }
        Ok(report)
    }
}

/// Backend that only logs what it would upload.
#[derive(Debug, Default)]
pub struct LogUploader;

#[async_trait]
impl Uploader for LogUploader {
    fn name(&self) -> &str {
        "debug"
    }

    async fn upload_records(&self, batch: Batch<'_>) -> Result<()> {
        match batch {
            Batch::Queued(entries) => {
                for e in entries {
                    info!(id = e.id, change = e.change.as_str(), object = %e.object_ref, "queued change");
                }
            }
            Batch::Initial(objects) => {
                for o in objects {
                    info!(object = %o.object_ref, title = %o.title, "initial object");
                }
            }
        }
        Ok(())
    }
}
