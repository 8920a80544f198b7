//! The thin abstraction over S3-compatible object storage that the assembly engine is written
//! against.
//!
//! The engine never downloads or uploads object payloads; everything it does is expressed in
//! terms of the multipart upload API plus listing, metadata, and deletion.  Keeping that surface
//! behind a trait lets the whole engine run against an in-memory store in tests, and leaves the
//! door open for other S3-compatible backends.
use crate::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::ops::Range;

mod s3;

pub use s3::S3Store;

/// The smallest part, other than the last one, that the store will accept in a multipart upload.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// The most parts one multipart upload may contain.
pub const MAX_PARTS_PER_UPLOAD: usize = 10_000;

/// The largest byte range one `UploadPartCopy` call may copy.
pub const MAX_COPY_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// One object in a source bucket that will become an entry in the archive.
///
/// Source objects are never read or rewritten; the engine only ever references their bytes via
/// server-side range copies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceObject {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// An object the engine itself produced, either a scratch intermediate or the final archive.
#[derive(Clone, Debug)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

/// One finished part of an in-flight multipart upload.
#[derive(Clone, Debug)]
pub struct CompletedPartInfo {
    pub part_number: i32,
    pub etag: String,
}

/// Render a half-open byte range the way the S3 copy API wants it: inclusive on both ends.
pub(crate) fn copy_source_range(range: &Range<u64>) -> String {
    format!("bytes={}-{}", range.start, range.end - 1)
}

/// Object storage operations the archive engine needs.
///
/// This maps one-to-one onto the S3 API calls the engine issues, so the production
/// implementation is a trivial passthrough to the AWS SDK.  All methods are expected to apply the
/// SDK's own retry policy internally; the engine treats any error that surfaces here as fatal for
/// the enclosing multipart upload.
#[async_trait::async_trait]
pub trait ObjectStore: std::fmt::Debug + Send + Sync + 'static {
    /// List every object under `prefix`, in lexicographic key order, across however many pages
    /// the store needs.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<SourceObject>>;

    /// Fetch the metadata of a single object without reading its payload.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<SourceObject>;

    /// Start a multipart upload and return its upload ID.
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String>;

    /// Upload one part from an in-memory buffer.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPartInfo>;

    /// Copy a byte range of an existing object into one part, entirely server-side.
    #[allow(clippy::too_many_arguments)]
    async fn upload_part_copy(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        src_bucket: &str,
        src_key: &str,
        range: Range<u64>,
    ) -> Result<CompletedPartInfo>;

    /// Commit the upload.  `parts` must already be sorted by part number.
    ///
    /// Returns the ETag of the completed object, if the store reports one.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPartInfo>,
    ) -> Result<Option<String>>;

    /// Abandon the upload, discarding any parts uploaded so far.
    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str)
        -> Result<()>;

    /// Delete a batch of objects.  Callers keep batches within the store's limit of 1000 keys.
    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<()>;
}
