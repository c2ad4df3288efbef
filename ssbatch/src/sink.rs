//! Packs each batch of fetched objects into a tar archive and uploads it.
use crate::objstore::{Bucket, FetchedObject};
use crate::{error, Config, Result};
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use snafu::prelude::*;
use std::io::{Read, Seek, SeekFrom, Write};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, warn};

/// What became of one batch after archiving.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// The destination key the archive was uploaded under.
    pub key: String,

    /// How many objects made it into the archive.
    pub objects: usize,

    /// The combined size of the archived objects' data, before tar framing and compression.
    pub total_object_bytes: u64,

    /// The size of the archive as uploaded.
    pub archive_bytes: u64,
}

/// The consumer end of the pipeline: receives one batch's objects and persists them somewhere.
///
/// The pipeline driver only ever talks to this trait, so tests can substitute a recording sink
/// and library users can redirect batches away from tar archives entirely.
#[async_trait::async_trait]
pub trait ArchiveSink: std::fmt::Debug + Send + Sync {
    /// Consume every object for batch `batch_index` from `objects` and persist them.
    ///
    /// The channel yields objects as their fetch jobs complete and closes once the batch's last
    /// job has finished.  An error here is fatal to the whole transfer.
    async fn archive_batch(
        &self,
        batch_index: usize,
        objects: mpsc::Receiver<FetchedObject>,
    ) -> Result<ArchiveSummary>;
}

/// An [`ArchiveSink`] that packs each batch into one (optionally gzipped) tar archive and uploads
/// it to the destination bucket.
#[derive(Debug)]
pub struct TarArchiveSink {
    dest: Box<dyn Bucket>,
    dest_prefix: String,
    compress: bool,
    in_memory: bool,
    skip_errors: bool,
}

impl TarArchiveSink {
    pub fn new(dest: Box<dyn Bucket>, dest_prefix: String, config: &Config) -> Self {
        let mut dest_prefix = dest_prefix;
        if !dest_prefix.is_empty() && !dest_prefix.ends_with('/') {
            dest_prefix.push('/');
        }

        Self {
            dest,
            dest_prefix,
            compress: config.compress,
            in_memory: config.in_memory,
            skip_errors: config.skip_errors,
        }
    }

    /// The destination key for one batch's archive.
    ///
    /// The batch index makes keys collision-free and sortable within a run; the timestamp keeps
    /// repeated runs against the same destination from overwriting each other.
    fn archive_key(&self, batch_index: usize) -> String {
        let extension = if self.compress { "tar.gz" } else { "tar" };

        format!(
            "{}batch-{:08}-{}.{}",
            self.dest_prefix,
            batch_index,
            Utc::now().timestamp_millis(),
            extension
        )
    }
}

#[async_trait::async_trait]
impl ArchiveSink for TarArchiveSink {
    async fn archive_batch(
        &self,
        batch_index: usize,
        objects: mpsc::Receiver<FetchedObject>,
    ) -> Result<ArchiveSummary> {
        let key = self.archive_key(batch_index);

        // Stage 1: build the complete archive into a local spool.  The tar and gzip encoders are
        // both blocking writers, so the whole construction runs on a blocking thread, pulling
        // objects from the channel as the fetch jobs deliver them.
        let handle = tokio::runtime::Handle::current();
        let compress = self.compress;
        let in_memory = self.in_memory;
        let skip_errors = self.skip_errors;

        let (mut spool, objects, total_object_bytes) =
            tokio::task::spawn_blocking(move || -> Result<(ArchiveSpool, usize, u64)> {
                let spool = ArchiveSpool::new(in_memory)?;

                if compress {
                    let encoder = GzEncoder::new(spool, Compression::default());
                    let (encoder, objects, bytes) =
                        append_objects(encoder, objects, handle, skip_errors)?;
                    let spool = encoder.finish().context(error::TarFinishSnafu)?;

                    Ok((spool, objects, bytes))
                } else {
                    append_objects(spool, objects, handle, skip_errors)
                }
            })
            .await
            .context(error::BackgroundTaskSnafu)??;

        if objects == 0 {
            // Every fetch in the batch failed, so there is nothing but a tar trailer to upload
            warn!(batch_index, "skipping upload of an archive with no entries");

            return Ok(ArchiveSummary {
                key,
                objects: 0,
                total_object_bytes: 0,
                archive_bytes: 0,
            });
        }

        // Stage 2: upload the spooled archive to the destination
        let archive_bytes = spool.len().context(error::ArchiveSpoolSnafu)?;

        debug!(batch_index, key = %key, objects, archive_bytes, "uploading batch archive");

        let (mut writer, upload_result) = self
            .dest
            .create_object_writer(key.clone(), Some(archive_bytes))
            .await?;

        let copy_result = async {
            let mut reader = spool.into_async_reader()?;

            tokio::io::copy(&mut reader, &mut writer)
                .await
                .context(error::UploadStreamSnafu)?;

            writer.shutdown().await.context(error::UploadStreamSnafu)?;

            Ok::<_, crate::BatchTransferError>(())
        }
        .await;

        // A failed copy usually means the upload worker bailed out first; its error is the
        // authoritative one, so consult it before reporting the copy failure
        drop(writer);
        let uploaded_bytes = upload_result.await?;
        copy_result?;

        debug_assert_eq!(uploaded_bytes, archive_bytes);

        Ok(ArchiveSummary {
            key,
            objects,
            total_object_bytes,
            archive_bytes: uploaded_bytes,
        })
    }
}

/// Append every object from the channel to a tar archive written to `writer`, blocking until the
/// channel closes.
///
/// Each object is buffered in full before its header is written, both so the header can state the
/// exact entry size and so a mid-body read fault doesn't leave a truncated entry behind.  With
/// `skip_errors` a failed read drops that one object; otherwise it fails the batch.
fn append_objects<W: Write>(
    writer: W,
    mut objects: mpsc::Receiver<FetchedObject>,
    handle: tokio::runtime::Handle,
    skip_errors: bool,
) -> Result<(W, usize, u64)> {
    let mut builder = tar::Builder::new(writer);
    let mut count = 0usize;
    let mut total_bytes = 0u64;

    while let Some(object) = objects.blocking_recv() {
        let mut data = Vec::with_capacity(object.size as usize);
        let mut body = SyncIoBridge::new_with_handle(object.body, handle.clone());

        match body.read_to_end(&mut data) {
            Ok(_) => {}
            Err(error) if skip_errors => {
                warn!(key = %object.key, %error, "dropping an object whose body could not be read");
                continue;
            }
            Err(error) => {
                return Err(error).context(error::TarAppendDataSnafu { key: object.key });
            }
        }

        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(object.last_modified.timestamp().max(0) as u64);

        builder
            .append_data(&mut header, &object.key, data.as_slice())
            .context(error::TarAppendDataSnafu {
                key: object.key.clone(),
            })?;

        count += 1;
        total_bytes += data.len() as u64;
    }

    let writer = builder.into_inner().context(error::TarFinishSnafu)?;

    Ok((writer, count, total_bytes))
}

/// Local staging for one batch's archive while it is being built.
///
/// In-memory spooling is the default and the fastest; disk spooling trades local I/O for a flat
/// memory footprint when batches are large.
enum ArchiveSpool {
    Memory(Vec<u8>),
    Disk(std::fs::File),
}

impl ArchiveSpool {
    fn new(in_memory: bool) -> Result<Self> {
        if in_memory {
            Ok(Self::Memory(Vec::new()))
        } else {
            let file = tempfile::tempfile().context(error::ArchiveSpoolSnafu)?;

            Ok(Self::Disk(file))
        }
    }

    fn len(&mut self) -> std::io::Result<u64> {
        match self {
            Self::Memory(buffer) => Ok(buffer.len() as u64),
            Self::Disk(file) => file.stream_position(),
        }
    }

    /// Consume the spool and re-open it for reading from the start.
    fn into_async_reader(self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        match self {
            Self::Memory(buffer) => Ok(Box::new(std::io::Cursor::new(buffer))),
            Self::Disk(mut file) => {
                file.seek(SeekFrom::Start(0))
                    .context(error::ArchiveSpoolSnafu)?;

                Ok(Box::new(tokio::fs::File::from_std(file)))
            }
        }
    }
}

impl Write for ArchiveSpool {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Memory(buffer) => std::io::Write::write(buffer, buf),
            Self::Disk(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Memory(buffer) => std::io::Write::flush(buffer),
            Self::Disk(file) => file.flush(),
        }
    }
}
