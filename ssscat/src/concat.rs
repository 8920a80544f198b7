//! Recursive concatenation of pieces that are individually too small to be multipart upload
//! parts.
//!
//! A flat multipart upload can't contain a 512-byte tar header as a non-final part, so small
//! pieces are folded in one at a time instead: starting from a 5 MiB zero-pad object, each step
//! is a two-part upload of `[accumulator, next piece]`.  The accumulator is always at least pad
//! sized, making it a legal first part, and the new piece is always the last part, where the
//! store accepts any size.  The price is one multipart upload per piece, which is why the
//! orchestrator batches pieces into groups and concatenates the groups in parallel.
use crate::assemble::assemble;
use crate::create::RunContext;
use crate::objstore::ObjectRef;
use crate::plan::Piece;
use crate::Result;
use tracing::debug;

/// The deterministic key of the singleton pad object, under the run's scratch prefix.
const PAD_OBJECT_NAME: &str = "pad_file";

/// Serial concatenator seeded with the run's singleton pad object.
///
/// Each [`Self::concat`] invocation runs its steps serially (every step consumes the previous
/// step's output), but separate invocations are independent and run in parallel.
pub(crate) struct RecursiveConcatenator {
    pad: ObjectRef,
}

impl RecursiveConcatenator {
    /// Materialize the pad object in the destination bucket, once per run.
    ///
    /// The pad is uploaded from the run's pre-allocated zero buffer as a single-part multipart
    /// upload, and lands under the scratch prefix so the post-run sweep removes it.
    pub async fn new(
        ctx: &RunContext,
        dst_bucket: &str,
        scratch_prefix: &str,
    ) -> Result<Self> {
        let key = format!("{scratch_prefix}/{PAD_OBJECT_NAME}");

        debug!(bucket = dst_bucket, key, "Materializing pad object");

        let pad = assemble(
            ctx,
            &[Piece::Literal {
                data: ctx.pad.clone(),
            }],
            dst_bucket,
            &key,
            0,
        )
        .await?;

        Ok(Self { pad })
    }

    /// Concatenate `pieces` in order into `dst_bucket`/`dst_key`.
    ///
    /// The result is the pad followed by the pieces' bytes; callers discard the pad by
    /// range-copying from offset 5 MiB or by trimming it during a later merge.  Intermediate
    /// steps land on `{dst_key}.step-{i}` so every scratch object this produces has a
    /// deterministic name under the same prefix as its target.
    pub async fn concat(
        &self,
        ctx: &RunContext,
        pieces: &[Piece],
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<ObjectRef> {
        debug_assert!(!pieces.is_empty(), "BUG: concatenating an empty piece list");

        let mut acc = self.pad.clone();

        for (index, piece) in pieces.iter().enumerate() {
            ctx.ensure_active()?;

            let step_key = if index == pieces.len() - 1 {
                dst_key.to_string()
            } else {
                format!("{dst_key}.step-{index}")
            };

            let acc_piece = Piece::Whole {
                bucket: acc.bucket.clone(),
                key: acc.key.clone(),
                size: acc.size,
            };

            acc = assemble(
                ctx,
                &[acc_piece, piece.clone()],
                dst_bucket,
                &step_key,
                0,
            )
            .await?;
        }

        debug!(
            bucket = dst_bucket,
            key = dst_key,
            size = acc.size,
            steps = pieces.len(),
            "Concatenated pieces"
        );

        Ok(acc)
    }
}
