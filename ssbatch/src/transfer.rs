//! The transfer pipeline driver.
//!
//! A transfer runs as a chain of stages: the source listing feeds a batcher, each batch fans out
//! into gated concurrent fetch jobs, and the fetched objects funnel through a single-slot channel
//! into the archive sink.  Batches are strictly sequential; all concurrency lives inside one
//! batch.
use crate::batcher::Batcher;
use crate::gate::JobGate;
use crate::objstore::{Bucket, FetchedObject, ObjectDescriptor, S3ObjectStorage};
use crate::sink::{ArchiveSink, ArchiveSummary, TarArchiveSink};
use crate::{error, BatchTransferError, Config, Result};
use aws_credential_types::Credentials;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

/// A callback implemented by callers who want to monitor the progress of a transfer.
///
/// All methods are optional; implement only the events of interest.  Methods are called from
/// async worker tasks, so they must not block.
pub trait TransferProgressCallback: Send + Sync {
    /// The source listing produced an entry that could not be read.  The entry is skipped.
    fn listing_error(&self, error: &BatchTransferError) {
        let _ = error;
    }

    /// An object's data was fetched from the source and handed to the archive sink.
    fn object_fetched(&self, key: &str, size: u64) {
        let _ = (key, size);
    }

    /// An object could not be fetched from the source and was dropped from its batch.
    fn object_skipped(&self, key: &str, error: &BatchTransferError) {
        let _ = (key, error);
    }

    /// A batch's archive was fully uploaded to the destination.
    fn batch_uploaded(&self, batch_index: usize, summary: &ArchiveSummary, elapsed: Duration) {
        let _ = (batch_index, summary, elapsed);
    }
}

/// The callback used when the caller doesn't provide one.
pub(crate) struct NoProgress;

impl TransferProgressCallback for NoProgress {}

/// The final tally of a completed transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// How many objects were copied into archives on the destination.
    pub total_objects: usize,

    /// The combined size of the copied objects' data.
    pub total_bytes: u64,

    /// How many archive batches were processed.
    pub batches: usize,
}

/// Builds a [`TransferJob`] connecting an S3 source bucket to an S3 destination bucket.
///
/// Both URLs use the `s3://bucket/prefix` form.  The prefix on the source selects which objects
/// to copy; the prefix on the destination is where the archive objects land.
#[derive(Debug)]
pub struct TransferJobBuilder {
    config: Config,
    source: Url,
    dest: Url,
    source_credentials: Option<Credentials>,
    dest_credentials: Option<Credentials>,
}

impl TransferJobBuilder {
    pub fn new(config: Config, source: Url, dest: Url) -> Self {
        Self {
            config,
            source,
            dest,
            source_credentials: None,
            dest_credentials: None,
        }
    }

    /// Use explicit credentials for the source bucket instead of the SDK's default sources.
    pub fn source_credentials(mut self, credentials: Credentials) -> Self {
        self.source_credentials = Some(credentials);
        self
    }

    /// Use explicit credentials for the destination bucket instead of the SDK's default sources.
    pub fn dest_credentials(mut self, credentials: Credentials) -> Self {
        self.dest_credentials = Some(credentials);
        self
    }

    /// Connect to both buckets, validate access, and produce a runnable job.
    pub async fn build(self) -> Result<TransferJob> {
        let source_storage = S3ObjectStorage::connect(
            &self.config,
            self.config.source_endpoint.clone(),
            self.source_credentials,
        )
        .await?;
        let (source, source_prefix) = source_storage.bucket_from_url(&self.source).await?;

        let dest_storage = S3ObjectStorage::connect(
            &self.config,
            self.config.dest_endpoint.clone(),
            self.dest_credentials,
        )
        .await?;
        let (dest, dest_prefix) = dest_storage.bucket_from_url(&self.dest).await?;

        let sink = TarArchiveSink::new(dest, dest_prefix, &self.config);

        TransferJob::new(self.config, source, source_prefix, Box::new(sink))
    }
}

/// A fully-wired batch transfer, ready to run.
#[derive(Debug)]
pub struct TransferJob {
    config: Config,
    source: Box<dyn Bucket>,
    source_prefix: String,
    sink: Box<dyn ArchiveSink>,
    gate: JobGate,
}

impl TransferJob {
    /// Wire a job from its parts.
    ///
    /// Use [`TransferJobBuilder`] for the common S3-to-S3 case; this constructor exists for
    /// callers bringing their own [`Bucket`] or [`ArchiveSink`] implementations.
    pub fn new(
        config: Config,
        source: Box<dyn Bucket>,
        source_prefix: String,
        sink: Box<dyn ArchiveSink>,
    ) -> Result<Self> {
        ensure!(config.batch_size > 0, error::InvalidBatchSizeSnafu);

        let gate = JobGate::new(config.effective_concurrency())?;

        Ok(Self {
            config,
            source,
            source_prefix,
            sink,
            gate,
        })
    }

    /// Run the transfer to completion without progress reporting.
    pub async fn run_without_progress(self) -> Result<TransferSummary> {
        self.run(Box::new(NoProgress)).await
    }

    /// Run the transfer to completion, reporting progress events to `progress`.
    pub async fn run(
        self,
        progress: Box<dyn TransferProgressCallback>,
    ) -> Result<TransferSummary> {
        let progress: Arc<dyn TransferProgressCallback> = Arc::from(progress);

        info!(
            source = %self.source.name(),
            prefix = %self.source_prefix,
            concurrency = self.gate.capacity(),
            batch_size = self.config.batch_size,
            "starting batch transfer"
        );

        let objects = self.source.list_objects(self.source_prefix.clone()).await?;
        let mut batcher = Batcher::new(objects, self.config.batch_size);

        let mut summary = TransferSummary::default();
        let mut batch_index = 0usize;

        while let Some(batch) = batcher.next_batch(progress.as_ref()).await {
            let started = Instant::now();
            let batch_len = batch.len();

            debug!(batch_index, objects = batch_len, "processing batch");

            // Single-slot handoff: each fetched object is held until the sink takes it, so fetch
            // jobs block on the archive keeping pace rather than piling up completed bodies
            let (sender, receiver) = mpsc::channel(1);

            let fan_out = tokio::spawn(fan_out_batch(
                self.source.clone(),
                self.gate.clone(),
                batch,
                sender,
                progress.clone(),
            ));

            let sink_result = self.sink.archive_batch(batch_index, receiver).await;

            // The fan-out completes even when the sink fails: a dropped receiver makes every
            // pending send fail, so the jobs drain instead of deadlocking
            fan_out.await.context(error::BackgroundTaskSnafu)?;

            let archive = sink_result?;
            let elapsed = started.elapsed();

            info!(
                batch_index,
                key = %archive.key,
                "Copied {} objects in {:?}",
                archive.objects,
                elapsed
            );
            progress.batch_uploaded(batch_index, &archive, elapsed);

            summary.total_objects += archive.objects;
            summary.total_bytes += archive.total_object_bytes;
            summary.batches += 1;
            batch_index += 1;
        }

        info!(
            total_objects = summary.total_objects,
            total_bytes = summary.total_bytes,
            batches = summary.batches,
            "batch transfer complete"
        );

        Ok(summary)
    }
}

/// Launch a gated fetch job for every object in the batch, then wait for all of them to finish.
///
/// Each job fetches one object and hands it to the sink through `sender`.  A failed fetch is
/// logged and dropped; the rest of the batch is unaffected.  The channel closes once the last
/// job has released its sender clone, which is the sink's signal that the batch is complete.
async fn fan_out_batch(
    source: Box<dyn Bucket>,
    gate: JobGate,
    batch: Vec<ObjectDescriptor>,
    sender: mpsc::Sender<FetchedObject>,
    progress: Arc<dyn TransferProgressCallback>,
) {
    for descriptor in batch {
        // Blocks until a slot frees up; this is what bounds the fan-out
        let permit = gate.acquire().await;

        let source = source.clone();
        let sender = sender.clone();
        let progress = progress.clone();

        tokio::spawn(async move {
            let _permit = permit;

            match source.fetch_object(&descriptor).await {
                Ok(object) => {
                    let size = object.size;

                    // A closed channel means the sink already failed; that error is reported
                    // from the sink so there is nothing to do here
                    if sender.send(object).await.is_ok() {
                        progress.object_fetched(&descriptor.key, size);
                    }
                }
                Err(error) => {
                    warn!(key = %descriptor.key, %error, "skipping an object that could not be fetched");
                    progress.object_skipped(&descriptor.key, &error);
                }
            }
        });
    }

    drop(sender);

    gate.wait_idle().await;
}
