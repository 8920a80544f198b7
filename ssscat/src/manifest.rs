//! The archive manifest, in both directions.
//!
//! Outbound: every archive gets a synthetic first entry, a CSV listing of the source objects
//! that went into it, so the archive is self-describing without reading any payload.
//!
//! Inbound: instead of archiving everything under a prefix, the caller can supply their own CSV
//! manifest selecting exactly which objects to archive.
use crate::objstore::{ObjectStore, SourceObject};
use crate::Result;
use bytes::Bytes;
use futures::StreamExt;
use snafu::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// The archive entry name of the generated manifest.
pub(crate) const MANIFEST_KEY: &str = "manifest.csv";

/// Max concurrent HeadObject calls when a caller-supplied manifest omits object sizes
const MAX_HEAD_CONCURRENCY: usize = 10;

/// Render the synthetic manifest payload: one `bucket,key,size,etag` record per source object,
/// in archive order.
///
/// The manifest lists only the real inputs; it does not list itself.
pub(crate) fn render(inputs: &[SourceObject]) -> Bytes {
    let mut writer = csv::Writer::from_writer(Vec::new());

    for input in inputs {
        writer
            .write_record([
                input.bucket.as_str(),
                input.key.as_str(),
                &input.size.to_string(),
                input.etag.as_deref().unwrap_or(""),
            ])
            .expect("BUG: writing CSV to memory cannot fail");
    }

    let data = writer
        .into_inner()
        .expect("BUG: flushing CSV to memory cannot fail");

    Bytes::from(data)
}

/// Load the source object list from a caller-supplied CSV manifest.
///
/// Each record is `bucket,key[,size[,etag]]`.  Records that omit the size are completed with a
/// HeadObject call, so a manifest can be as simple as a list of bucket/key pairs.
pub(crate) async fn load_csv(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
    skip_header: bool,
) -> Result<Vec<SourceObject>> {
    debug!(path = %path.display(), skip_header, "Loading source manifest");

    let file = std::fs::File::open(path).with_context(|_| crate::error::ManifestReadSnafu {
        path: path.to_path_buf(),
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(skip_header)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut partial = Vec::new();
    for (index, result) in reader.records().enumerate() {
        let record = result.with_context(|_| crate::error::ManifestParseSnafu {
            path: path.to_path_buf(),
        })?;

        let record_number = record
            .position()
            .map(|position| position.record())
            .unwrap_or(index as u64);

        let invalid = |reason: &str| {
            crate::error::ManifestRecordInvalidSnafu {
                path: path.to_path_buf(),
                record: record_number,
                reason: reason.to_string(),
            }
            .build()
        };

        let bucket = record
            .get(0)
            .filter(|bucket| !bucket.is_empty())
            .ok_or_else(|| invalid("missing bucket"))?
            .to_string();
        let key = record
            .get(1)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| invalid("missing key"))?
            .to_string();

        let size = match record.get(2).filter(|size| !size.is_empty()) {
            Some(size) => Some(
                size.parse::<u64>()
                    .map_err(|_| invalid("size is not an integer"))?,
            ),
            None => None,
        };
        let etag = record
            .get(3)
            .filter(|etag| !etag.is_empty())
            .map(|etag| etag.to_string());

        partial.push((bucket, key, size, etag));
    }

    // Records that came with a size are taken at face value; the rest need a HeadObject call
    let lookups = partial.into_iter().map(|(bucket, key, size, etag)| {
        let store = store.clone();

        async move {
            match size {
                Some(size) => Ok(SourceObject {
                    bucket,
                    key,
                    size,
                    etag,
                    last_modified: None,
                }),
                None => store.head_object(&bucket, &key).await,
            }
        }
    });

    // `buffered` rather than `buffer_unordered` so the archive preserves manifest order
    let objects = futures::stream::iter(lookups)
        .buffered(MAX_HEAD_CONCURRENCY)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

    debug!(count = objects.len(), "Loaded source manifest");

    Ok(objects)
}
