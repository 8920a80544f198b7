//! Rewriting the assembled object into its final form: leading pad trimmed, parts evenly sized.
//!
//! After final assembly the object holds `pad + archive`, and its part layout mirrors however
//! the archive happened to be batched.  The redistributor rewrites it under the final key using
//! nothing but range copies of the object itself, dropping the pad and re-slicing the bytes into
//! balanced parts, which is friendlier to downstream parallel readers.
use crate::assemble::assemble;
use crate::create::RunContext;
use crate::objstore::{ObjectRef, MAX_COPY_PART_SIZE, MAX_PARTS_PER_UPLOAD, MIN_PART_SIZE};
use crate::plan::Piece;
use crate::Result;
use tracing::debug;

/// Policy choosing how many parts the final object is sliced into.
///
/// The window is a search range: the redistributor scans from `max` part counts down looking for
/// a count that divides the archive evenly, and settles for the middle of the window (letting
/// the last part absorb the remainder) when nothing divides.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartCountPolicy {
    /// Hard ceiling on parts per upload imposed by the store.
    pub max_parts: u64,

    /// No part other than the last may be smaller than this.
    pub min_part_size: u64,

    /// No single range copy may be larger than this.
    pub max_part_size: u64,
}

impl Default for PartCountPolicy {
    fn default() -> Self {
        Self {
            max_parts: MAX_PARTS_PER_UPLOAD as u64,
            min_part_size: MIN_PART_SIZE,
            max_part_size: MAX_COPY_PART_SIZE,
        }
    }
}

impl PartCountPolicy {
    /// The `(min, max, mid)` part count window for an object of `final_size` bytes.
    ///
    /// `max` divides by the minimum part size rounding *down*, so that any count in the window
    /// yields parts at or above the minimum; `min` is forced up by the per-part size ceiling.
    pub(crate) fn window(&self, final_size: u64) -> (u64, u64, u64) {
        let max = (final_size / self.min_part_size).clamp(1, self.max_parts);
        let min = final_size.div_ceil(self.max_part_size).clamp(1, max);
        let mid = (min + max) / 2;

        (min, max, mid)
    }
}

/// Rewrite `obj` as `dst_bucket`/`dst_key`, dropping the first `trim_offset` bytes and slicing
/// the rest into evenly sized parts.
pub(crate) async fn redistribute(
    ctx: &RunContext,
    obj: &ObjectRef,
    trim_offset: u64,
    dst_bucket: &str,
    dst_key: &str,
) -> Result<ObjectRef> {
    let final_size = obj.size - trim_offset;
    let (min, max, mid) = ctx.config.part_count_policy.window(final_size);

    let part_count = (min..=max)
        .rev()
        .find(|count| final_size % count == 0)
        .unwrap_or(mid);
    let part_size = final_size / part_count;

    debug!(
        bucket = dst_bucket,
        key = dst_key,
        final_size,
        part_count,
        part_size,
        "Redistributing final object"
    );

    let mut pieces = Vec::with_capacity(part_count as usize + 1);
    let mut start = 0u64;
    while start < final_size {
        pieces.push(Piece::Range {
            bucket: obj.bucket.clone(),
            key: obj.key.clone(),
            range: trim_offset + start..trim_offset + (start + part_size).min(final_size),
        });
        start += part_size;
    }

    assemble(ctx, &pieces, dst_bucket, dst_key, 0).await
}
