//! `ssscat` builds a POSIX tar archive in S3-compatible object storage by concatenating objects
//! that are already there, entirely server-side.
//!
//! No object payload ever passes through the process running this crate.  The archive is put
//! together with the store's multipart upload API: tar headers and padding are uploaded as
//! literal parts, and every payload is stitched in with `UploadPartCopy` range copies.  The
//! interesting machinery exists to satisfy the API's constraint that every part except the last
//! must be at least 5 MiB, which a 512-byte tar header has no hope of meeting on its own.
//!
//! The typical usage pattern:
//!
//! 1. Build an [`ArchiveSource`] (a bucket prefix, or a CSV manifest of objects) and an
//!    [`ArchiveDestination`].
//! 2. Construct a [`CreateArchiveJobBuilder`], then call
//!    [`build`](CreateArchiveJobBuilder::build) to enumerate and validate the inputs.
//! 3. Call [`run`](CreateArchiveJob::run) on the resulting job.
//!
//! The finished archive contains one entry per source object, byte-identical to the source,
//! preceded by a synthetic `manifest.csv` entry listing everything in the archive.

mod assemble;
mod concat;
mod config;
mod create;
mod error;
mod header;
mod manifest;
pub mod objstore;
mod plan;
mod redistribute;

pub use config::Config;
pub use create::{
    ArchiveDestination, ArchiveSource, CreateArchiveJob, CreateArchiveJobBuilder,
    CreateProgressCallback,
};
pub use error::{Result, S3CatError};
pub use objstore::{ObjectRef, ObjectStore, S3Store, SourceObject};
pub use redistribute::PartCountPolicy;
