//! Streaming upload writers for S3 archive objects.
//!
//! Each writer hands the caller one half of an in-memory duplex pipe and spawns a worker that
//! drains the other half into S3.  Writes see backpressure from the upload itself, so a slow
//! destination throttles archive production instead of buffering it without bound.
use crate::{error, Result};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::BytesMut;
use futures::future::BoxFuture;
use futures::FutureExt;
use snafu::prelude::*;
use tokio::io::{AsyncReadExt, DuplexStream};
use tracing::{debug, warn};

/// Start a multi-part upload of `key`, returning the writer half and a future that resolves with
/// the total bytes uploaded once the upload completes or fails.
///
/// The upload is driven by a spawned worker, so the caller only has to write and then `shutdown`
/// the writer; the returned future should be awaited afterwards to learn the outcome.  A failed
/// upload is aborted on the service so no orphaned parts accrue storage charges.
pub(crate) fn multipart(
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
    chunk_size: usize,
) -> (DuplexStream, BoxFuture<'static, Result<u64>>) {
    let (reader, writer) = tokio::io::duplex(chunk_size);

    let worker = tokio::spawn(async move {
        let upload = client
            .create_multipart_upload()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .with_context(|_| error::CreateMultipartUploadSnafu {
                bucket: bucket.clone(),
                key: key.clone(),
            })?;

        let upload_id = upload
            .upload_id
            .expect("BUG: CreateMultipartUpload response always carries an upload ID");

        match upload_parts(&client, &bucket, &key, &upload_id, chunk_size, reader).await {
            Ok(total_bytes) => Ok(total_bytes),
            Err(error) => {
                // Clean up the partial upload; the original error is what gets reported
                if let Err(abort_error) = client
                    .abort_multipart_upload()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(bucket = %bucket, key = %key, error = ?abort_error,
                        "failed to abort the multi-part upload; orphaned parts may remain");
                }

                Err(error)
            }
        }
    });

    let result = async move { worker.await.context(error::BackgroundTaskSnafu)? }.boxed();

    (writer, result)
}

async fn upload_parts(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
    chunk_size: usize,
    mut reader: DuplexStream,
) -> Result<u64> {
    let mut completed_parts = Vec::new();
    let mut part_number = 1i32;
    let mut total_bytes = 0u64;

    loop {
        let mut chunk = BytesMut::with_capacity(chunk_size);

        // Fill a whole chunk before uploading; the duplex read can return short counts
        let mut eof = false;
        while chunk.len() < chunk_size {
            let read = reader
                .read_buf(&mut chunk)
                .await
                .context(error::UploadStreamSnafu)?;

            if read == 0 {
                eof = true;
                break;
            }
        }

        if chunk.is_empty() {
            if total_bytes == 0 {
                // The writer was dropped without writing anything
                return error::UploadAbandonedSnafu {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
                .fail();
            }

            break;
        }

        let chunk_len = chunk.len() as u64;

        let response = client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(chunk.freeze()))
            .send()
            .await
            .with_context(|_| error::UploadPartSnafu {
                bucket: bucket.to_string(),
                key: key.to_string(),
                part_number,
            })?;

        completed_parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .e_tag(response.e_tag.unwrap_or_default())
                .build(),
        );

        total_bytes += chunk_len;
        part_number += 1;

        if eof {
            break;
        }
    }

    client
        .complete_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .multipart_upload(
            CompletedMultipartUpload::builder()
                .set_parts(Some(completed_parts))
                .build(),
        )
        .send()
        .await
        .with_context(|_| error::CompleteMultipartUploadSnafu {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;

    debug!(bucket, key, total_bytes, parts = part_number - 1, "completed multi-part upload");

    Ok(total_bytes)
}

/// Start a single-request upload of `key` for objects below the multi-part threshold.
///
/// `PutObject` needs the whole body up front, so the worker buffers everything written before
/// issuing one request.  Only used for small archives, where the buffering is cheaper than the
/// extra requests of a multi-part upload.
pub(crate) fn unipart(
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
) -> (DuplexStream, BoxFuture<'static, Result<u64>>) {
    const PIPE_BUFFER_SIZE: usize = 64 * 1024;

    let (mut reader, writer) = tokio::io::duplex(PIPE_BUFFER_SIZE);

    let worker = tokio::spawn(async move {
        let mut body = Vec::new();

        reader
            .read_to_end(&mut body)
            .await
            .context(error::UploadStreamSnafu)?;

        if body.is_empty() {
            return error::UploadAbandonedSnafu { bucket, key }.fail();
        }

        let total_bytes = body.len() as u64;

        client
            .put_object()
            .bucket(&bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|_| error::PutObjectSnafu {
                bucket: bucket.clone(),
                key: key.clone(),
            })?;

        debug!(bucket = %bucket, key = %key, total_bytes, "completed unipart upload");

        Ok(total_bytes)
    });

    let result = async move { worker.await.context(error::BackgroundTaskSnafu)? }.boxed();

    (writer, result)
}
