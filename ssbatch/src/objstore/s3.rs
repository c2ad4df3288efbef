//! The S3 implementation of the object storage abstraction.
use super::{Bucket, FetchedObject, ObjectDescriptor};
use crate::{error, writers, Config, Result};
use aws_credential_types::Credentials;
use aws_smithy_types_convert::date_time::DateTimeExt;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::StreamExt;
use snafu::prelude::*;
use snafu::IntoError;
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::debug;
use url::Url;

/// A connection to an S3 or S3-compatible object storage service.
///
/// The source and destination of a transfer each get their own connection, since they can point
/// at different endpoints with different credentials.
#[derive(Clone, Debug)]
pub struct S3ObjectStorage {
    client: aws_sdk_s3::Client,
    config: Config,
}

impl S3ObjectStorage {
    /// Connect to S3, or to the S3-compatible service at `endpoint` if one is given.
    ///
    /// When `credentials` is `None` the AWS SDK's usual credential sources apply (environment,
    /// profile, instance metadata).
    pub async fn connect(
        config: &Config,
        endpoint: Option<Url>,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        // `max_attempts` counts the initial request, so the configured value maps directly
        let retry_config =
            aws_config::retry::RetryConfig::standard().with_max_attempts(config.max_retries.max(1));

        let mut loader =
            aws_config::defaults(aws_config::BehaviorVersion::latest()).retry_config(retry_config);

        if let Some(credentials) = credentials {
            loader = loader.credentials_provider(credentials);
        }

        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = endpoint {
            debug!(endpoint = %endpoint, "using a custom S3 endpoint");

            // Most S3-compatible implementations don't support virtual-hosted bucket addressing
            builder = builder
                .endpoint_url(endpoint.to_string())
                .force_path_style(true);
        }

        let client = aws_sdk_s3::Client::from_conf(builder.build());

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Resolve an `s3://bucket/prefix` URL into a validated bucket handle and the key prefix
    /// embedded in the URL.
    ///
    /// Validation performs a `HeadBucket` call, so a typo'd bucket name or missing grant is
    /// reported up front rather than partway through a transfer.
    pub async fn bucket_from_url(&self, url: &Url) -> Result<(Box<dyn Bucket>, String)> {
        ensure!(
            url.scheme() == "s3",
            error::UnsupportedObjectStorageSnafu { url: url.clone() }
        );

        let name = url
            .host_str()
            .filter(|host| !host.is_empty())
            .context(error::MissingBucketSnafu { url: url.clone() })?
            .to_string();

        let prefix = url.path().trim_start_matches('/').to_string();

        self.client
            .head_bucket()
            .bucket(&name)
            .send()
            .await
            .with_context(|_| error::BucketInvalidOrNotAccessibleSnafu {
                bucket: name.clone(),
            })?;

        debug!(bucket = %name, prefix = %prefix, "validated access to S3 bucket");

        let bucket = S3Bucket {
            inner: Arc::new(S3BucketInner {
                name,
                client: self.client.clone(),
                multipart_threshold: self.config.multipart_threshold.get_bytes() as u64,
                multipart_chunk_size: self.config.multipart_chunk_size.get_bytes() as usize,
            }),
        };

        Ok((Box::new(bucket), prefix))
    }
}

/// A bucket in an S3 or S3-compatible object storage service.
#[derive(Clone)]
struct S3Bucket {
    inner: Arc<S3BucketInner>,
}

struct S3BucketInner {
    name: String,
    client: aws_sdk_s3::Client,
    multipart_threshold: u64,
    multipart_chunk_size: usize,
}

impl fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Bucket")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl S3Bucket {
    /// Translate one `ListObjectsV2` entry into a descriptor, tolerating the optionality the SDK
    /// imposes on fields the service in practice always returns.
    fn descriptor_from_listing(
        bucket: &str,
        object: aws_sdk_s3::types::Object,
    ) -> Result<ObjectDescriptor> {
        let key = object.key.ok_or_else(|| {
            error::ListingItemSnafu {
                bucket: bucket.to_string(),
                message: "listing entry is missing its key".to_string(),
            }
            .build()
        })?;

        let size = object.size.unwrap_or_default().max(0) as u64;

        let last_modified = match object.last_modified {
            Some(timestamp) => timestamp.to_chrono_utc().unwrap_or_else(|_| Utc::now()),
            None => Utc::now(),
        };

        Ok(ObjectDescriptor {
            key,
            size,
            last_modified,
        })
    }
}

#[async_trait::async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn list_objects(
        &self,
        prefix: String,
    ) -> Result<futures::stream::BoxStream<'static, Result<ObjectDescriptor>>> {
        let inner = self.inner.clone();

        let paginator = inner
            .client
            .list_objects_v2()
            .bucket(&inner.name)
            .prefix(&prefix)
            .into_paginator()
            .send();

        // The paginator isn't a `Stream`, so unfold it into one, page by page.  No page is
        // requested until the stream is polled past the previous one, which keeps listing
        // lock-step with batching.
        let pages = futures::stream::unfold(Some(paginator), move |state| {
            let bucket = inner.name.clone();
            let prefix = prefix.clone();

            async move {
                let mut paginator = state?;

                match paginator.next().await {
                    None => None,
                    Some(Ok(page)) => {
                        let items = page
                            .contents
                            .unwrap_or_default()
                            .into_iter()
                            .map(|object| Self::descriptor_from_listing(&bucket, object))
                            .collect::<Vec<_>>();

                        Some((items, Some(paginator)))
                    }
                    Some(Err(e)) => {
                        // A failed listing request ends the stream after reporting the error;
                        // there is no cursor to continue from
                        let error = error::ListObjectsSnafu { bucket, prefix }.into_error(e);

                        Some((vec![Err(error)], None))
                    }
                }
            }
        });

        Ok(pages.map(futures::stream::iter).flatten().boxed())
    }

    async fn fetch_object(&self, descriptor: &ObjectDescriptor) -> Result<FetchedObject> {
        let response = self
            .inner
            .client
            .get_object()
            .bucket(&self.inner.name)
            .key(&descriptor.key)
            .send()
            .await
            .with_context(|_| error::GetObjectSnafu {
                bucket: self.inner.name.clone(),
                key: descriptor.key.clone(),
            })?;

        // Prefer the response metadata over the listing's, in case the object changed in between
        let size = response
            .content_length
            .map(|length| length.max(0) as u64)
            .unwrap_or(descriptor.size);

        let last_modified: DateTime<Utc> = response
            .last_modified
            .and_then(|timestamp| timestamp.to_chrono_utc().ok())
            .unwrap_or(descriptor.last_modified);

        Ok(FetchedObject {
            key: descriptor.key.clone(),
            size,
            last_modified,
            body: Box::new(response.body.into_async_read()),
        })
    }

    async fn create_object_writer(
        &self,
        key: String,
        size_hint: Option<u64>,
    ) -> Result<(
        Box<dyn AsyncWrite + Send + Unpin>,
        BoxFuture<'static, Result<u64>>,
    )> {
        // With no size hint, assume the worst; a multi-part upload of a small object costs a
        // couple of extra requests, while a unipart upload of a huge one fails outright
        let multipart = size_hint
            .map(|size| size >= self.inner.multipart_threshold)
            .unwrap_or(true);

        let client = self.inner.client.clone();
        let bucket = self.inner.name.clone();

        if multipart {
            debug!(bucket = %bucket, key = %key, ?size_hint, "uploading with the multi-part API");

            let (writer, result) = writers::multipart(
                client,
                bucket,
                key,
                self.inner.multipart_chunk_size,
            );

            Ok((Box::new(writer), result))
        } else {
            debug!(bucket = %bucket, key = %key, ?size_hint, "uploading with a single PutObject");

            let (writer, result) = writers::unipart(client, bucket, key);

            Ok((Box::new(writer), result))
        }
    }
}
