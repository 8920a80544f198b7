//! The parallel multipart-upload assembler: turn an ordered list of pieces into one object.
//!
//! This is the only place the engine opens multipart uploads.  Part numbers are assigned from
//! piece order before anything is dispatched, so the parallel completion order of the individual
//! uploads and copies has no effect on the final byte layout.
use crate::create::RunContext;
use crate::objstore::{CompletedPartInfo, ObjectRef, MAX_PARTS_PER_UPLOAD};
use crate::plan::Piece;
use crate::Result;
use futures::StreamExt;
use snafu::prelude::*;
use tracing::{debug, warn};

/// Assemble `pieces`, in order, into the object `dst_bucket`/`dst_key` via a single multipart
/// upload.
///
/// Literal pieces are uploaded as part bodies; remote pieces become server-side range copies.
/// If `trim_prefix` is non-zero, that many bytes are dropped from the front of the first piece.
///
/// Every piece but the last must satisfy the store's minimum part size; violations surface as
/// store errors.  Exactly one multipart upload is created, and it is either completed or aborted
/// before this function returns.
pub(crate) async fn assemble(
    ctx: &RunContext,
    pieces: &[Piece],
    dst_bucket: &str,
    dst_key: &str,
    trim_prefix: u64,
) -> Result<ObjectRef> {
    ensure!(
        pieces.len() <= MAX_PARTS_PER_UPLOAD,
        crate::error::TooManyPartsSnafu {
            count: pieces.len(),
            max: MAX_PARTS_PER_UPLOAD,
        }
    );
    ctx.ensure_active()?;

    let upload_id = ctx
        .store
        .create_multipart_upload(dst_bucket, dst_key)
        .await?;

    debug!(
        bucket = dst_bucket,
        key = dst_key,
        pieces = pieces.len(),
        trim_prefix,
        "Assembling object"
    );

    let mut total_size = 0u64;
    let part_futs = pieces
        .iter()
        .enumerate()
        .map(|(index, piece)| {
            let piece = if index == 0 && trim_prefix > 0 {
                trim_piece(piece, trim_prefix)
            } else {
                piece.clone()
            };
            total_size += piece.len();

            let part_number = (index + 1) as i32;
            let store = ctx.store.clone();
            let cancel = ctx.cancel.clone();
            let upload_id = upload_id.clone();
            let dst_bucket = dst_bucket.to_string();
            let dst_key = dst_key.to_string();

            async move {
                ensure!(!cancel.is_cancelled(), crate::error::AbortedSnafu);

                match piece {
                    Piece::Literal { data } => {
                        store
                            .upload_part(&dst_bucket, &dst_key, &upload_id, part_number, data)
                            .await
                    }
                    Piece::Range { bucket, key, range } => {
                        store
                            .upload_part_copy(
                                &dst_bucket,
                                &dst_key,
                                &upload_id,
                                part_number,
                                &bucket,
                                &key,
                                range,
                            )
                            .await
                    }
                    Piece::Whole { bucket, key, size } => {
                        store
                            .upload_part_copy(
                                &dst_bucket,
                                &dst_key,
                                &upload_id,
                                part_number,
                                &bucket,
                                &key,
                                0..size,
                            )
                            .await
                    }
                }
            }
        })
        .collect::<Vec<_>>();

    // Dispatch with bounded concurrency, and collect *every* outcome rather than bailing on the
    // first error, so no part operation is still in flight when the upload gets aborted
    let results = futures::stream::iter(part_futs)
        .buffer_unordered(ctx.config.max_concurrent_parts)
        .collect::<Vec<Result<CompletedPartInfo>>>()
        .await;

    let mut parts = Vec::with_capacity(results.len());
    let mut first_error = None;
    for result in results {
        match result {
            Ok(part) => parts.push(part),
            Err(error) => first_error = first_error.or(Some(error)),
        }
    }

    if let Some(error) = first_error {
        abort_upload(ctx, dst_bucket, dst_key, &upload_id).await;
        return Err(error);
    }

    parts.sort_by_key(|part| part.part_number);

    let etag = match ctx
        .store
        .complete_multipart_upload(dst_bucket, dst_key, &upload_id, parts)
        .await
    {
        Ok(etag) => etag,
        Err(error) => {
            abort_upload(ctx, dst_bucket, dst_key, &upload_id).await;
            return Err(error);
        }
    };

    debug!(
        bucket = dst_bucket,
        key = dst_key,
        size = total_size,
        "Assembled object"
    );

    Ok(ObjectRef {
        bucket: dst_bucket.to_string(),
        key: dst_key.to_string(),
        size: total_size,
        etag,
    })
}

/// Best-effort abort of a failed upload.  The original failure is what gets surfaced; a failure
/// to abort only leaves a stale upload behind, which the store expires on its own.
async fn abort_upload(ctx: &RunContext, bucket: &str, key: &str, upload_id: &str) {
    if let Err(error) = ctx
        .store
        .abort_multipart_upload(bucket, key, upload_id)
        .await
    {
        warn!(bucket, key, %upload_id, ?error, "Failed to abort multipart upload");
    }
}

/// Drop the first `trim` bytes of a piece.
fn trim_piece(piece: &Piece, trim: u64) -> Piece {
    debug_assert!(trim < piece.len(), "BUG: trimming away an entire piece");

    match piece {
        Piece::Literal { data } => Piece::Literal {
            data: data.slice(trim as usize..),
        },
        Piece::Range { bucket, key, range } => Piece::Range {
            bucket: bucket.clone(),
            key: key.clone(),
            range: range.start + trim..range.end,
        },
        Piece::Whole { bucket, key, size } => Piece::Range {
            bucket: bucket.clone(),
            key: key.clone(),
            range: trim..*size,
        },
    }
}
