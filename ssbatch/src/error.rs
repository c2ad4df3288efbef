use snafu::prelude::*;
use url::Url;

pub type Result<T, E = BatchTransferError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BatchTransferError {
    #[snafu(display("The URL '{url}' doesn't correspond to any supported object storage technology.  Supported URL schemes are: s3"))]
    UnsupportedObjectStorage { url: Url },

    #[snafu(display("The S3 URL '{url}' is missing the bucket name"))]
    MissingBucket { url: Url },

    #[snafu(display("The concurrency cap must be at least 1"))]
    InvalidConcurrency,

    #[snafu(display("The batch size must be at least 1"))]
    InvalidBatchSize,

    #[snafu(display(
        "The S3 bucket '{bucket}' either doesn't exist, or your IAM identity is not granted access"
    ))]
    BucketInvalidOrNotAccessible {
        bucket: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_bucket::HeadBucketError>,
    },

    #[snafu(display("Error listing objects in S3 bucket '{bucket}' with prefix '{prefix}'"))]
    ListObjects {
        bucket: String,
        prefix: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error,
        >,
    },

    #[snafu(display("Error opening object '{key}' in S3 bucket '{bucket}'"))]
    GetObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>,
    },

    /// Object-level fetch failure reported by a non-SDK storage backend.
    ///
    /// The S3 backend reports [`Self::GetObject`] instead, carrying the SDK error as the source.
    #[snafu(display("Object '{key}' in bucket '{bucket}' is missing or not readable"))]
    ObjectNotFound { bucket: String, key: String },

    /// Listing-item failure reported by a non-SDK storage backend.
    #[snafu(display("Error listing objects in bucket '{bucket}': {message}"))]
    ListingItem { bucket: String, message: String },

    /// Archive upload failure reported by a non-SDK storage backend.
    #[snafu(display("Error uploading archive '{key}' to bucket '{bucket}': {message}"))]
    UploadArchive {
        bucket: String,
        key: String,
        message: String,
    },

    #[snafu(display("Error starting multi-part upload of '{key}' to S3 bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError,
        >,
    },

    #[snafu(display("Error uploading part {part_number} of '{key}' to S3 bucket '{bucket}'"))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: i32,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::upload_part::UploadPartError>,
    },

    #[snafu(display("Error completing multi-part upload of '{key}' to S3 bucket '{bucket}'"))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError,
        >,
    },

    #[snafu(display("Error uploading object '{key}' to S3 bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::put_object::PutObjectError>,
    },

    #[snafu(display("The upload of '{key}' was abandoned before any data was written"))]
    UploadAbandoned { bucket: String, key: String },

    #[snafu(display("Error appending object '{key}' to the tar archive"))]
    TarAppendData {
        key: String,
        source: std::io::Error,
    },

    #[snafu(display("Error finalizing the tar archive"))]
    TarFinish { source: std::io::Error },

    #[snafu(display("Error spooling archive data"))]
    ArchiveSpool { source: std::io::Error },

    #[snafu(display("Error streaming archive data to the uploader"))]
    UploadStream { source: std::io::Error },

    #[snafu(display("A background worker task panicked or was cancelled"))]
    BackgroundTask { source: tokio::task::JoinError },
}
