use snafu::prelude::*;
use std::path::PathBuf;

pub type Result<T, E = S3CatError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum S3CatError {
    #[snafu(display(
        "Exactly one of a source manifest or a source bucket and prefix must be provided"
    ))]
    AmbiguousSource,

    #[snafu(display("The source manifest '{}' could not be read", path.display()))]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("The source manifest '{}' is not valid CSV", path.display()))]
    ManifestParse { path: PathBuf, source: csv::Error },

    #[snafu(display("Record {record} in manifest '{}' is malformed: {reason}", path.display()))]
    ManifestRecordInvalid {
        path: PathBuf,
        record: u64,
        reason: String,
    },

    #[snafu(display(
        "The total size of all source objects ({total_size} bytes) is less than {min_size} bytes; \
         the object store cannot hold a smaller multipart object.  Include more files"
    ))]
    TotalSizeTooSmall { total_size: u64, min_size: u64 },

    #[snafu(display("Error listing objects in S3 bucket '{bucket}' with prefix '{prefix}'"))]
    ListObjects {
        bucket: String,
        prefix: String,
        source:
            aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error>,
    },

    #[snafu(display("Error getting metadata for object '{key}' in S3 bucket '{bucket}'"))]
    HeadObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>,
    },

    #[snafu(display("Error starting multipart upload for '{key}' in S3 bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError,
        >,
    },

    #[snafu(display("Error uploading part {part_number} of '{key}' in S3 bucket '{bucket}'"))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: i32,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::upload_part::UploadPartError>,
    },

    #[snafu(display(
        "Error copying range '{range}' of 's3://{src_bucket}/{src_key}' into part {part_number} \
         of '{key}' in S3 bucket '{bucket}'"
    ))]
    UploadPartCopy {
        bucket: String,
        key: String,
        part_number: i32,
        src_bucket: String,
        src_key: String,
        range: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::upload_part_copy::UploadPartCopyError,
        >,
    },

    #[snafu(display("Error completing multipart upload for '{key}' in S3 bucket '{bucket}'"))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError,
        >,
    },

    #[snafu(display("Error aborting multipart upload for '{key}' in S3 bucket '{bucket}'"))]
    AbortMultipartUpload {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::abort_multipart_upload::AbortMultipartUploadError,
        >,
    },

    #[snafu(display("Error deleting scratch objects from S3 bucket '{bucket}'"))]
    DeleteObjects {
        bucket: String,
        source:
            aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::delete_objects::DeleteObjectsError>,
    },

    #[snafu(display(
        "The object store did not return an upload ID for the multipart upload of '{key}' in \
         bucket '{bucket}'"
    ))]
    MissingUploadId { bucket: String, key: String },

    #[snafu(display(
        "The object store did not return an ETag for part {part_number} of '{key}' in bucket \
         '{bucket}'"
    ))]
    MissingPartEtag {
        bucket: String,
        key: String,
        part_number: i32,
    },

    #[snafu(display("The tar header for entry '{key}' could not be constructed"))]
    TarHeader {
        key: String,
        source: std::io::Error,
    },

    #[snafu(display(
        "BUG: the planned archive length {len} is not a multiple of the tar block size"
    ))]
    PlanNotBlockAligned { len: u64 },

    #[snafu(display(
        "BUG: group {index} is {size} bytes, smaller than the minimum part size, and is not the \
         final group"
    ))]
    UndersizedGroup { index: usize, size: u64 },

    #[snafu(display(
        "The archive would require {count} parts in one multipart upload, but the object store \
         allows at most {max}"
    ))]
    TooManyParts { count: usize, max: usize },

    /// The store itself refused an operation.  Produced by non-SDK [`crate::ObjectStore`]
    /// implementations, which have no `SdkError` to wrap.
    #[snafu(display("The object store rejected the request: {message}"))]
    StoreRejected { message: String },

    #[snafu(display("The operation was aborted before the archive was completed"))]
    Aborted,
}
