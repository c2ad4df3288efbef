//! An in-memory [`Bucket`] implementation with fault injection.
//!
//! The pipeline only ever talks to the `Bucket` trait, so the integration tests can drive the
//! whole thing against this implementation: listing faults, fetch faults, upload faults, and
//! artificial fetch latency (to make concurrency observable) are all injectable per bucket.
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use rand::RngCore;
use ssbatch::{BatchTransferError, Bucket, FetchedObject, ObjectDescriptor};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

#[derive(Clone, Debug)]
struct StoredObject {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// An archive object a transfer uploaded to an in-memory destination bucket.
#[derive(Clone, Debug)]
pub struct UploadedArchive {
    pub key: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Keys whose fetch should fail.
    fetch_failures: HashSet<String>,

    /// Listing positions at which to inject an error item, in addition to the real entries.
    listing_errors: Vec<usize>,

    /// Artificial latency added to every fetch.
    fetch_delay: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    name: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    faults: Mutex<Faults>,
    fail_uploads: AtomicBool,
    uploads: Mutex<Vec<UploadedArchive>>,
    active_fetches: AtomicUsize,
    peak_fetches: AtomicUsize,
}

/// An in-memory bucket holding objects in a sorted map, which matches the lexicographic listing
/// order of real S3.
#[derive(Clone)]
pub struct InMemoryBucket {
    inner: Arc<Inner>,
}

impl fmt::Debug for InMemoryBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBucket")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl InMemoryBucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                objects: Mutex::new(BTreeMap::new()),
                faults: Mutex::new(Faults::default()),
                fail_uploads: AtomicBool::new(false),
                uploads: Mutex::new(Vec::new()),
                active_fetches: AtomicUsize::new(0),
                peak_fetches: AtomicUsize::new(0),
            }),
        }
    }

    pub fn put_object(&self, key: impl Into<String>, data: Vec<u8>) {
        self.inner.objects.lock().unwrap().insert(
            key.into(),
            StoredObject {
                data,
                last_modified: Utc::now(),
            },
        );
    }

    /// Fill the bucket with `count` objects of `size` random bytes each, under `prefix`, and
    /// return the expected key-to-data map for later comparison against archive contents.
    pub fn populate(&self, prefix: &str, count: usize, size: usize) -> HashMap<String, Vec<u8>> {
        let mut rng = rand::thread_rng();
        let mut expected = HashMap::with_capacity(count);

        for i in 0..count {
            let key = format!("{prefix}object-{i:05}.dat");
            let mut data = vec![0u8; size];
            rng.fill_bytes(&mut data);

            expected.insert(key.clone(), data.clone());
            self.put_object(key, data);
        }

        expected
    }

    /// Make every future fetch of `key` fail.
    pub fn fail_fetch(&self, key: impl Into<String>) {
        self.inner
            .faults
            .lock()
            .unwrap()
            .fetch_failures
            .insert(key.into());
    }

    /// Inject an error item into the listing stream at `position`.
    ///
    /// The error is an extra item; it doesn't displace any real entry.
    pub fn inject_listing_error(&self, position: usize) {
        self.inner
            .faults
            .lock()
            .unwrap()
            .listing_errors
            .push(position);
    }

    /// Make every future archive upload fail.
    pub fn fail_uploads(&self) {
        self.inner.fail_uploads.store(true, Ordering::SeqCst);
    }

    /// Add artificial latency to every fetch, widening the window in which concurrent fetches
    /// overlap so the peak is observable.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.inner.faults.lock().unwrap().fetch_delay = Some(delay);
    }

    /// The highest number of fetches that were ever in flight at the same instant.
    pub fn peak_concurrent_fetches(&self) -> usize {
        self.inner.peak_fetches.load(Ordering::SeqCst)
    }

    /// Every archive uploaded to this bucket so far, in upload order.
    pub fn uploads(&self) -> Vec<UploadedArchive> {
        self.inner.uploads.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Bucket for InMemoryBucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn list_objects(
        &self,
        prefix: String,
    ) -> Result<
        futures::stream::BoxStream<'static, Result<ObjectDescriptor, BatchTransferError>>,
        BatchTransferError,
    > {
        let name = self.inner.name.clone();

        let descriptors = self
            .inner
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, object)| {
                Ok(ObjectDescriptor {
                    key: key.clone(),
                    size: object.data.len() as u64,
                    last_modified: object.last_modified,
                })
            })
            .collect::<Vec<_>>();

        let mut items = descriptors;
        let mut positions = self.inner.faults.lock().unwrap().listing_errors.clone();
        positions.sort_unstable();

        for position in positions.into_iter().rev() {
            let error = BatchTransferError::ListingItem {
                bucket: name.clone(),
                message: "injected listing fault".to_string(),
            };

            items.insert(position.min(items.len()), Err(error));
        }

        Ok(futures::stream::iter(items).boxed())
    }

    async fn fetch_object(
        &self,
        descriptor: &ObjectDescriptor,
    ) -> Result<FetchedObject, BatchTransferError> {
        let (failed, delay) = {
            let faults = self.inner.faults.lock().unwrap();

            (
                faults.fetch_failures.contains(&descriptor.key),
                faults.fetch_delay,
            )
        };

        if failed {
            return Err(BatchTransferError::ObjectNotFound {
                bucket: self.inner.name.clone(),
                key: descriptor.key.clone(),
            });
        }

        let active = self.inner.active_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_fetches.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let object = self
            .inner
            .objects
            .lock()
            .unwrap()
            .get(&descriptor.key)
            .cloned();

        self.inner.active_fetches.fetch_sub(1, Ordering::SeqCst);

        let object = object.ok_or_else(|| BatchTransferError::ObjectNotFound {
            bucket: self.inner.name.clone(),
            key: descriptor.key.clone(),
        })?;

        Ok(FetchedObject {
            key: descriptor.key.clone(),
            size: object.data.len() as u64,
            last_modified: object.last_modified,
            body: Box::new(std::io::Cursor::new(object.data)),
        })
    }

    async fn create_object_writer(
        &self,
        key: String,
        _size_hint: Option<u64>,
    ) -> Result<
        (
            Box<dyn AsyncWrite + Send + Unpin>,
            BoxFuture<'static, Result<u64, BatchTransferError>>,
        ),
        BatchTransferError,
    > {
        if self.inner.fail_uploads.load(Ordering::SeqCst) {
            return Err(BatchTransferError::UploadArchive {
                bucket: self.inner.name.clone(),
                key,
                message: "injected upload fault".to_string(),
            });
        }

        let (mut reader, writer) = tokio::io::duplex(64 * 1024);
        let inner = self.inner.clone();

        let worker = tokio::spawn(async move {
            let mut data = Vec::new();

            reader
                .read_to_end(&mut data)
                .await
                .map_err(|e| BatchTransferError::UploadArchive {
                    bucket: inner.name.clone(),
                    key: key.clone(),
                    message: e.to_string(),
                })?;

            let bytes = data.len() as u64;

            inner
                .uploads
                .lock()
                .unwrap()
                .push(UploadedArchive { key, data });

            Ok(bytes)
        });

        let result = async move {
            worker
                .await
                .map_err(|source| BatchTransferError::BackgroundTask { source })?
        }
        .boxed();

        Ok((Box::new(writer), result))
    }
}

/// An object body that yields a little data and then fails, for exercising mid-read fault
/// handling in the archive sink.
pub struct FailingBody {
    prelude: std::io::Cursor<Vec<u8>>,
    failed: bool,
}

impl FailingBody {
    pub fn new(prelude: Vec<u8>) -> Self {
        Self {
            prelude: std::io::Cursor::new(prelude),
            failed: false,
        }
    }
}

impl AsyncRead for FailingBody {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();

        match std::pin::Pin::new(&mut self.prelude).poll_read(cx, buf) {
            std::task::Poll::Ready(Ok(())) if buf.filled().len() == before => {
                if self.failed {
                    std::task::Poll::Ready(Ok(()))
                } else {
                    self.failed = true;

                    std::task::Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "injected body fault",
                    )))
                }
            }
            other => other,
        }
    }
}
