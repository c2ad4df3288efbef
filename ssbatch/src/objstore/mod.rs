//! Abstraction over the object storage services a transfer reads from and writes to.
//!
//! The pipeline itself only ever talks to the [`Bucket`] trait; the S3 implementation lives in
//! [`s3`].  Keeping the seam here lets the test suite drive the pipeline against an in-memory
//! bucket with injected faults, without a live S3 endpoint.
use crate::Result;
use chrono::{DateTime, Utc};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

mod s3;

pub use s3::S3ObjectStorage;

/// A single object discovered by listing the source bucket.
///
/// This is what flows through the batcher: just enough metadata to fetch the object later and to
/// write a faithful tar header for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// An object's data and metadata, produced by a fetch job and consumed by the archive sink.
///
/// The body is a streaming reader, not a buffer; dropping it abandons the underlying read.
pub struct FetchedObject {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub body: Box<dyn AsyncRead + Send + Unpin>,
}

impl fmt::Debug for FetchedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedObject")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("last_modified", &self.last_modified)
            .finish_non_exhaustive()
    }
}

/// A bucket in an object storage system, either the source or the destination of a transfer.
#[async_trait::async_trait]
pub trait Bucket: dyn_clone::DynClone + fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Lazily list the objects in this bucket whose keys start with `prefix`.
    ///
    /// Objects are produced in the order the service reports them, and nothing past the current
    /// page is requested until the stream is polled again.  An `Err` item reflects a fault with
    /// one listing result, not the end of the stream; callers may keep polling after it.
    async fn list_objects(
        &self,
        prefix: String,
    ) -> Result<futures::stream::BoxStream<'static, Result<ObjectDescriptor>>>;

    /// Open the named object for reading.
    async fn fetch_object(&self, descriptor: &ObjectDescriptor) -> Result<FetchedObject>;

    /// Open a writer which uploads everything written to it as the object `key`.
    ///
    /// `size_hint` is the caller's estimate of the total upload size, used only to choose an
    /// upload strategy; the actual number of bytes written may differ.  The returned future
    /// resolves once the upload is either fully complete or abandoned, reporting the total bytes
    /// uploaded.  Dropping the writer without calling `shutdown` abandons the upload.
    async fn create_object_writer(
        &self,
        key: String,
        size_hint: Option<u64>,
    ) -> Result<(
        Box<dyn AsyncWrite + Send + Unpin>,
        futures::future::BoxFuture<'static, Result<u64>>,
    )>;
}

dyn_clone::clone_trait_object!(Bucket);
