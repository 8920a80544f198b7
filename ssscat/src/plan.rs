//! Planning of the archive byte layout.
//!
//! The planner turns the ordered list of source objects into a [`Plan`]: the exact sequence of
//! byte regions — header literals, payload range copies, the trailer — whose concatenation is the
//! finished archive.  Planning is pure; no store calls happen here, and planning the same input
//! twice produces the same byte layout.
//!
//! The plan does not include the 5 MiB leading pad that assembly temporarily prepends so that
//! every multipart upload stays above the store's minimum part size.  The pad is an assembly
//! artifact owned by the run, recorded on the plan only as [`Plan::trim_prefix`] so later stages
//! know how much to cut off the front.
use crate::objstore::{SourceObject, MIN_PART_SIZE};
use crate::{header, manifest, Result};
use bytes::Bytes;
use snafu::prelude::*;
use std::ops::Range;

/// The zero pad placed at the start of every assembled object, sized to the smallest part the
/// store will accept so that the pad alone can serve as a legal first part.
pub(crate) const LEADING_PAD: u64 = MIN_PART_SIZE;

/// One atomic unit of archive assembly: either bytes the engine holds in memory, or a byte range
/// of an object already in the store.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Piece {
    /// An in-memory buffer: a tar header, the synthetic manifest payload, or the trailer.
    Literal { data: Bytes },

    /// A byte range of a remote object, stitched in by server-side copy.  Half-open.
    Range {
        bucket: String,
        key: String,
        range: Range<u64>,
    },

    /// An entire remote object.  Shorthand for the range `0..size`.
    Whole {
        bucket: String,
        key: String,
        size: u64,
    },
}

impl Piece {
    pub fn len(&self) -> u64 {
        match self {
            Self::Literal { data } => data.len() as u64,
            Self::Range { range, .. } => range.end - range.start,
            Self::Whole { size, .. } => *size,
        }
    }
}

/// Where one archive entry's header and payload landed in the plan, and where its payload sits
/// in the final archive's byte stream.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct EntrySpan {
    pub key: String,

    /// Index of the entry's header piece.
    pub header_index: usize,

    /// Index of the entry's payload piece.  `None` for zero-length entries, which consist of a
    /// header only.
    pub payload_index: Option<usize>,

    /// Byte offset of the payload within the archive (leading pad excluded).
    pub payload_offset: u64,

    pub payload_len: u64,
}

/// The full layout of the archive: pieces in order, plus enough structure to recover each entry's
/// location.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Plan {
    pub pieces: Vec<Piece>,

    /// Bytes to drop from the very start of the assembled object.  Always [`LEADING_PAD`]: the
    /// pad isn't part of the archive, it only exists to satisfy the store's minimum part size.
    pub trim_prefix: u64,

    /// One span per archive entry, in archive order.  Index 0 is the synthetic manifest.
    pub entries: Vec<EntrySpan>,

    /// Total archive length in bytes (pad excluded): the sum of all piece lengths.
    pub total_len: u64,
}

/// Lay out the archive for the given source objects.
///
/// A synthetic manifest entry listing every input is prepended as the first archive entry, then
/// each input contributes its header and payload, and the trailer closes the archive out to a
/// block multiple with two zero blocks at the end.
pub(crate) fn build_plan(inputs: &[SourceObject]) -> Result<Plan> {
    let manifest_data = manifest::render(inputs);

    let manifest_entry = SourceObject {
        bucket: String::new(),
        key: manifest::MANIFEST_KEY.to_string(),
        size: manifest_data.len() as u64,
        etag: None,
        last_modified: None,
    };

    let mut pieces = Vec::with_capacity(inputs.len() * 2 + 3);
    let mut entries = Vec::with_capacity(inputs.len() + 1);
    let mut total_len = 0u64;
    let mut predecessor: Option<&SourceObject> = None;

    for (index, entry) in std::iter::once(&manifest_entry).chain(inputs).enumerate() {
        let header = header::build_header(entry, predecessor)?;
        let header_index = pieces.len();
        total_len += header.len() as u64;
        pieces.push(Piece::Literal { data: header });

        let payload_offset = total_len;
        let payload_index = if entry.size > 0 {
            let payload_index = pieces.len();
            if index == 0 {
                pieces.push(Piece::Literal {
                    data: manifest_data.clone(),
                });
            } else {
                pieces.push(Piece::Whole {
                    bucket: entry.bucket.clone(),
                    key: entry.key.clone(),
                    size: entry.size,
                });
            }
            Some(payload_index)
        } else {
            // A zero-length entry is just its header; an empty range copy can't be expressed
            None
        };
        total_len += entry.size;

        entries.push(EntrySpan {
            key: entry.key.clone(),
            header_index,
            payload_index,
            payload_offset,
            payload_len: entry.size,
        });

        predecessor = Some(entry);
    }

    pieces.push(Piece::Literal {
        data: header::trailer(total_len),
    });
    total_len = pieces.iter().map(Piece::len).sum();

    ensure!(
        total_len % header::BLOCK_SIZE == 0,
        crate::error::PlanNotBlockAlignedSnafu { len: total_len }
    );

    Ok(Plan {
        pieces,
        trim_prefix: LEADING_PAD,
        entries,
        total_len,
    })
}

/// A contiguous run of plan pieces sized so its assembled object can serve as a non-final
/// multipart upload part in the final merge.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Group {
    /// Half-open range of piece indices.
    pub pieces: Range<usize>,

    /// Total byte size of the pieces in this group.
    pub size: u64,
}

/// Partition the plan's pieces into batches for parallel assembly.
///
/// A batch is closed as soon as it exceeds `batch_target`, so every batch but the last exceeds
/// the target.  A trailing remainder smaller than the store's minimum part size is folded into
/// the previous batch, leaving the last batch as the only one allowed to be undersized (it
/// becomes the final part of the final merge, where the store permits any size).
pub(crate) fn create_groups(plan: &Plan, batch_target: u64) -> Vec<Group> {
    // A target below the minimum part size would produce batches unusable as non-final parts
    let batch_target = batch_target.max(MIN_PART_SIZE);

    let mut groups = Vec::new();
    let mut start = 0usize;
    let mut curr = 0u64;

    for (index, piece) in plan.pieces.iter().enumerate() {
        curr += piece.len();

        if curr > batch_target {
            groups.push(Group {
                pieces: start..index + 1,
                size: curr,
            });
            start = index + 1;
            curr = 0;
        }
    }

    if start < plan.pieces.len() {
        if curr < MIN_PART_SIZE && !groups.is_empty() {
            // Too small to stand alone; fold the remainder into the previous batch
            let last = groups.last_mut().expect("BUG: just checked non-empty");
            last.pieces.end = plan.pieces.len();
            last.size += curr;
        } else {
            groups.push(Group {
                pieces: start..plan.pieces.len(),
                size: curr,
            });
        }
    }

    if groups.is_empty() {
        // The entire plan fits comfortably in one batch
        groups.push(Group {
            pieces: 0..plan.pieces.len(),
            size: plan.total_len,
        });
    }

    groups
}

/// Check the grouping invariant the store forces on us: every group but the last must be usable
/// as a non-final part.  A violation is a planning bug, caught before anything is uploaded.
pub(crate) fn validate_groups(groups: &[Group]) -> Result<()> {
    for (index, group) in groups.iter().enumerate() {
        ensure!(
            index == groups.len() - 1 || group.size >= MIN_PART_SIZE,
            crate::error::UndersizedGroupSnafu {
                index,
                size: group.size
            }
        );
    }

    Ok(())
}
