//! Implementation of the operation which builds a tar archive out of objects already in object
//! storage, without moving their payloads through this process.
//!
//! The caller starts with [`CreateArchiveJobBuilder`], which enumerates the source objects and
//! validates the inputs, then calls [`CreateArchiveJobBuilder::build`] to get a
//! [`CreateArchiveJob`].  [`CreateArchiveJob::run`] performs the job.  Progress is reported via a
//! caller-provided implementation of the [`CreateProgressCallback`] trait.
//!
//! Internally the job picks one of two strategies:
//!
//! * the *large-file path*, when every source object is at least the store's minimum part size:
//!   each object is paired with its successor's tar header and the pairs are concatenated in
//!   parallel, then merged and rewritten with balanced parts;
//! * the *small-file path*, when any object is smaller than that: the plan is batched into
//!   groups big enough to act as multipart upload parts, groups are concatenated in parallel,
//!   and the group objects are merged directly into the final archive.
use crate::concat::RecursiveConcatenator;
use crate::objstore::{ObjectRef, ObjectStore, S3Store, SourceObject, MIN_PART_SIZE};
use crate::plan::{self, Piece, Plan};
use crate::redistribute::redistribute;
use crate::{assemble::assemble, manifest, Config, Result};
use bytes::Bytes;
use futures::StreamExt;
use snafu::prelude::*;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// Max number of keys one DeleteObjects call may carry
const DELETE_BATCH: usize = 1000;

/// Which objects go into the archive.
#[derive(Clone, Debug)]
pub enum ArchiveSource {
    /// A CSV manifest on the local filesystem naming the objects to archive, in order.
    Manifest {
        path: PathBuf,

        /// Skip the first record of the manifest, for manifests with a header row.
        skip_header: bool,
    },

    /// Every object under a prefix, in key order.
    Prefix { bucket: String, prefix: String },
}

impl ArchiveSource {
    /// Build a source from independently-supplied options, enforcing that exactly one source
    /// mechanism was chosen.
    pub fn from_options(
        manifest: Option<PathBuf>,
        skip_manifest_header: bool,
        src_bucket: Option<String>,
        src_prefix: Option<String>,
    ) -> Result<Self> {
        match (manifest, src_bucket, src_prefix) {
            (Some(path), None, None) => Ok(Self::Manifest {
                path,
                skip_header: skip_manifest_header,
            }),
            (None, Some(bucket), Some(prefix)) => Ok(Self::Prefix { bucket, prefix }),
            _ => crate::error::AmbiguousSourceSnafu.fail(),
        }
    }
}

/// Where the finished archive goes.
#[derive(Clone, Debug)]
pub struct ArchiveDestination {
    pub bucket: String,

    /// Prefix under which the final object and all scratch objects are placed.  May be empty.
    pub prefix: String,

    /// Object name of the archive, appended to the prefix.
    pub key: String,
}

impl ArchiveDestination {
    pub(crate) fn final_key(&self) -> String {
        join_key(&self.prefix, &self.key)
    }

    pub(crate) fn temp_key(&self) -> String {
        format!("{}.temp", self.final_key())
    }

    pub(crate) fn parts_prefix(&self) -> String {
        join_key(&self.prefix, "parts")
    }

    pub(crate) fn headers_prefix(&self) -> String {
        join_key(&self.prefix, "headers")
    }
}

fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');

    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// A trait which callers can implement to get detailed progress updates as archive creation is
/// progressing.
#[allow(unused_variables)]
pub trait CreateProgressCallback: Sync + Send {
    /// The source objects have been enumerated and the job is starting.
    fn sources_enumerated(&self, total_objects: usize, total_bytes: u64) {}

    /// The archive layout has been planned.  `archive_size` is the exact size the final archive
    /// will have.
    fn plan_built(&self, pieces: usize, archive_size: u64) {}

    /// One batch (small-file path) or payload/header pair (large-file path) has been assembled
    /// into a scratch object of `size` archive bytes.
    fn batch_assembled(&self, index: usize, size: u64) {}

    /// All content has been merged into a single object of `size` archive bytes.
    fn archive_assembled(&self, size: u64) {}

    /// The archive has been rewritten under its final key with balanced parts.
    fn archive_redistributed(&self, size: u64) {}

    /// Scratch objects have been swept after a successful run.
    fn scratch_cleaned(&self, objects_deleted: usize) {}
}

/// Everything a single run threads through the engine: the store client, the tunables, the
/// cancellation token, and the pre-allocated zero pad buffer.
pub(crate) struct RunContext {
    pub store: Arc<dyn ObjectStore>,
    pub config: Config,
    pub cancel: CancellationToken,
    pub pad: Bytes,
}

impl RunContext {
    /// Fail fast if the run has been aborted.  Checked between steps so that a cancelled run
    /// stops issuing new store calls promptly while in-flight calls finish normally.
    pub fn ensure_active(&self) -> Result<()> {
        ensure!(!self.cancel.is_cancelled(), crate::error::AbortedSnafu);

        Ok(())
    }
}

#[derive(Debug)]
pub struct CreateArchiveJobBuilder {
    config: Config,
    source: ArchiveSource,
    destination: ArchiveDestination,
    store: Option<Arc<dyn ObjectStore>>,
}

impl CreateArchiveJobBuilder {
    /// Initialize a new create archive job builder, but don't yet start the job.
    pub fn new(config: Config, source: ArchiveSource, destination: ArchiveDestination) -> Self {
        Self {
            config,
            source,
            destination,
            store: None,
        }
    }

    /// Use a specific [`ObjectStore`] implementation instead of constructing an S3 client from
    /// the config.
    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Enumerate the source objects and construct the job (but don't run it yet).
    ///
    /// This is where all input validation happens: a job that builds successfully will not fail
    /// for input reasons later, only for store reasons.  Enumerating a prefix with a huge number
    /// of objects can take a while.
    pub async fn build(self) -> Result<CreateArchiveJob> {
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(S3Store::new(&self.config).await),
        };

        debug!(source = ?self.source, "Enumerating source objects");

        let inputs = match &self.source {
            ArchiveSource::Manifest { path, skip_header } => {
                manifest::load_csv(&store, path, *skip_header).await?
            }
            ArchiveSource::Prefix { bucket, prefix } => store.list_objects(bucket, prefix).await?,
        };

        let total_size = inputs.iter().map(|input| input.size).sum::<u64>();
        ensure!(
            total_size >= MIN_PART_SIZE,
            crate::error::TotalSizeTooSmallSnafu {
                total_size,
                min_size: MIN_PART_SIZE,
            }
        );

        Ok(CreateArchiveJob {
            config: self.config,
            store,
            destination: self.destination,
            inputs,
        })
    }
}

/// A job which will create a tar archive in object storage from objects already there.
pub struct CreateArchiveJob {
    config: Config,
    store: Arc<dyn ObjectStore>,
    destination: ArchiveDestination,
    inputs: Vec<SourceObject>,
}

impl CreateArchiveJob {
    /// The total number of payload bytes that will go into the archive
    pub fn total_bytes(&self) -> u64 {
        self.inputs.iter().map(|input| input.size).sum()
    }

    /// The total number of source objects included in this archive, not counting the synthetic
    /// manifest
    pub fn total_objects(&self) -> usize {
        self.inputs.len()
    }

    /// Alternative to [`Self::run`] which doesn't require a [`CreateProgressCallback`]
    /// implementation, for callers that do not care about progress information.
    pub async fn run_without_progress(
        self,
        abort: impl Future<Output = ()> + Send + 'static,
    ) -> Result<ObjectRef> {
        // A dummy impl of the progress callback that doesn't do anything with any of the
        // progress updates
        struct NoProgress {}
        impl CreateProgressCallback for NoProgress {}

        self.run(abort, NoProgress {}).await
    }

    /// Run the job, returning only when the archive is complete (or the job failed).
    ///
    /// If the `abort` future completes, the job stops issuing new store calls, aborts its
    /// in-flight multipart uploads, and returns an error.  Scratch objects are left behind in
    /// that case (and on any other failure) so the remains can be inspected; they all live under
    /// the `parts/` scratch prefix and can be swept at leisure.
    pub async fn run<Abort, Progress>(self, abort: Abort, progress: Progress) -> Result<ObjectRef>
    where
        Abort: Future<Output = ()> + Send + 'static,
        Progress: CreateProgressCallback + 'static,
    {
        let cancel = CancellationToken::new();
        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                abort.await;
                cancel.cancel();
            }
        });

        let span = info_span!(
            "create_archive",
            dst_bucket = %self.destination.bucket,
            dst_key = %self.destination.final_key(),
        );
        let result = self
            .run_inner(cancel, Arc::new(progress))
            .instrument(span)
            .await;

        // The abort future may well never complete; don't leave its task behind
        watcher.abort();

        result
    }

    async fn run_inner(
        self,
        cancel: CancellationToken,
        progress: Arc<dyn CreateProgressCallback>,
    ) -> Result<ObjectRef> {
        let total_bytes = self.total_bytes();
        let total_objects = self.total_objects();

        info!(total_objects, total_bytes, "Starting archive creation");
        progress.sources_enumerated(total_objects, total_bytes);

        // Entries below the minimum part size can't be flat multipart upload parts, which is
        // what forces the batched small-file strategy
        let small_files = self.inputs.iter().any(|input| input.size < MIN_PART_SIZE);

        let plan = plan::build_plan(&self.inputs)?;
        debug!(
            pieces = plan.pieces.len(),
            archive_size = plan.total_len,
            small_files,
            "Planned archive layout"
        );
        progress.plan_built(plan.pieces.len(), plan.total_len);

        let ctx = RunContext {
            store: self.store.clone(),
            config: self.config.clone(),
            cancel,
            pad: Bytes::from(vec![0u8; plan.trim_prefix as usize]),
        };

        let concatenator =
            RecursiveConcatenator::new(&ctx, &self.destination.bucket, &self.destination.parts_prefix())
                .await?;

        let final_object = if small_files {
            self.run_small_files(&ctx, &plan, &concatenator, &progress)
                .await?
        } else {
            self.run_large_files(&ctx, &plan, &concatenator, &progress)
                .await?
        };

        ctx.ensure_active()?;
        let deleted = self.cleanup(&ctx).await?;
        progress.scratch_cleaned(deleted);

        info!(
            bucket = %final_object.bucket,
            key = %final_object.key,
            size = final_object.size,
            "Finished archive"
        );

        Ok(final_object)
    }

    /// The small-file path: batch the plan into groups, concatenate each group in parallel, then
    /// merge the group objects into the final archive, trimming the leading pad during the
    /// merge.
    async fn run_small_files(
        &self,
        ctx: &RunContext,
        plan: &Plan,
        concatenator: &RecursiveConcatenator,
        progress: &Arc<dyn CreateProgressCallback>,
    ) -> Result<ObjectRef> {
        let groups = plan::create_groups(plan, self.config.batch_size_bytes());
        plan::validate_groups(&groups)?;

        debug!(groups = groups.len(), "Taking the small-file path");

        let parts_prefix = self.destination.parts_prefix();
        let group_futs = groups.iter().enumerate().map(|(index, group)| {
            let pieces = &plan.pieces[group.pieces.clone()];
            let key = format!(
                "{parts_prefix}/iteration.batch.{}-{}",
                group.pieces.start,
                group.pieces.end - 1
            );
            let progress = progress.clone();

            async move {
                let object = concatenator
                    .concat(ctx, pieces, &self.destination.bucket, &key)
                    .await?;

                progress.batch_assembled(index, object.size - plan.trim_prefix);

                Ok((index, object))
            }
        });

        let intermediates =
            collect_indexed(group_futs, self.config.max_concurrent_parts).await?;

        // The batches were sized so each group object (sans pad) can be a non-final part in the
        // final merge.  If one still came up short, fold the group objects together one at a
        // time instead of merging them flat
        let undersized = intermediates[..intermediates.len() - 1]
            .iter()
            .any(|(_, object)| object.size - plan.trim_prefix < MIN_PART_SIZE);

        ctx.ensure_active()?;

        let final_object = if !undersized {
            let pieces = merge_pieces(&intermediates, plan.trim_prefix);
            assemble(
                ctx,
                &pieces,
                &self.destination.bucket,
                &self.destination.final_key(),
                plan.trim_prefix,
            )
            .await?
        } else {
            debug!("A group came up undersized; merging group objects recursively");

            let mut acc = intermediates[0].1.clone();
            for (step, (_, object)) in intermediates.iter().enumerate().skip(1) {
                ctx.ensure_active()?;

                let last = step == intermediates.len() - 1;
                let step_key = if last {
                    self.destination.final_key()
                } else {
                    format!("{parts_prefix}/final.step-{step}")
                };
                let trim = if last { plan.trim_prefix } else { 0 };

                let pieces = [
                    Piece::Whole {
                        bucket: acc.bucket.clone(),
                        key: acc.key.clone(),
                        size: acc.size,
                    },
                    Piece::Range {
                        bucket: object.bucket.clone(),
                        key: object.key.clone(),
                        range: plan.trim_prefix..object.size,
                    },
                ];

                acc = assemble(ctx, &pieces, &self.destination.bucket, &step_key, trim).await?;
            }

            acc
        };

        progress.archive_assembled(final_object.size);

        Ok(final_object)
    }

    /// The large-file path: every payload is big enough to be a part on its own, so each entry
    /// is paired with its successor's header and the pairs are concatenated in parallel, merged
    /// into an oversized object, and rewritten with balanced parts.
    async fn run_large_files(
        &self,
        ctx: &RunContext,
        plan: &Plan,
        concatenator: &RecursiveConcatenator,
        progress: &Arc<dyn CreateProgressCallback>,
    ) -> Result<ObjectRef> {
        debug!(pairs = plan.entries.len(), "Taking the large-file path");

        let parts_prefix = self.destination.parts_prefix();
        let pair_futs = plan.entries.iter().enumerate().map(|(index, span)| {
            // The first pair carries its own header (nothing precedes it); every pair carries
            // its successor's header, or the trailer after the last entry
            let mut pieces = Vec::with_capacity(3);
            if index == 0 {
                pieces.push(plan.pieces[span.header_index].clone());
            }
            if let Some(payload_index) = span.payload_index {
                pieces.push(plan.pieces[payload_index].clone());
            }
            match plan.entries.get(index + 1) {
                Some(next) => pieces.push(plan.pieces[next.header_index].clone()),
                None => pieces.push(
                    plan.pieces
                        .last()
                        .expect("BUG: a plan always ends with the trailer")
                        .clone(),
                ),
            }

            let key = format!("{parts_prefix}/{index}.part-{}.hdr", index + 1);
            let progress = progress.clone();

            async move {
                let size = pieces.iter().map(Piece::len).sum::<u64>();
                let object = concatenator
                    .concat(ctx, &pieces, &self.destination.bucket, &key)
                    .await?;

                progress.batch_assembled(index, size);

                Ok((index, object))
            }
        });

        let intermediates = collect_indexed(pair_futs, self.config.max_concurrent_pairs).await?;

        ctx.ensure_active()?;

        // Merge everything into one oversized object that still carries the leading pad...
        let pieces = merge_pieces(&intermediates, plan.trim_prefix);
        let oversized = assemble(
            ctx,
            &pieces,
            &self.destination.bucket,
            &self.destination.temp_key(),
            0,
        )
        .await?;
        progress.archive_assembled(oversized.size - plan.trim_prefix);

        ctx.ensure_active()?;

        // ...then rewrite it under the final key, pad trimmed and parts balanced
        let final_object = redistribute(
            ctx,
            &oversized,
            plan.trim_prefix,
            &self.destination.bucket,
            &self.destination.final_key(),
        )
        .await?;
        progress.archive_redistributed(final_object.size);

        Ok(final_object)
    }

    /// Sweep every scratch object a successful run may have left: the `parts/` and `headers/`
    /// prefixes plus the pre-redistribution temp object.
    async fn cleanup(&self, ctx: &RunContext) -> Result<usize> {
        let mut keys = Vec::new();
        for prefix in [
            self.destination.parts_prefix(),
            self.destination.headers_prefix(),
        ] {
            keys.extend(
                ctx.store
                    .list_objects(&self.destination.bucket, &prefix)
                    .await?
                    .into_iter()
                    .map(|object| object.key),
            );
        }
        keys.push(self.destination.temp_key());

        debug!(count = keys.len(), "Deleting scratch objects");

        let deleted = keys.len();
        for batch in keys.chunks(DELETE_BATCH) {
            ctx.store
                .delete_objects(&self.destination.bucket, batch.to_vec())
                .await?;
        }

        Ok(deleted)
    }
}

impl std::fmt::Debug for CreateArchiveJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateArchiveJob")
            .field("destination", &self.destination)
            .field("inputs", &self.inputs.len())
            .finish()
    }
}

/// Drive a collection of index-tagged futures with bounded concurrency, wait for all of them
/// even if one fails, and return the successful results sorted back into input order.
async fn collect_indexed<F>(futs: impl Iterator<Item = F>, limit: usize) -> Result<Vec<(usize, ObjectRef)>>
where
    F: Future<Output = Result<(usize, ObjectRef)>>,
{
    let results = futures::stream::iter(futs)
        .buffer_unordered(limit)
        .collect::<Vec<_>>()
        .await;

    let mut indexed = Vec::with_capacity(results.len());
    let mut first_error = None;
    for result in results {
        match result {
            Ok(pair) => indexed.push(pair),
            Err(error) => first_error = first_error.or(Some(error)),
        }
    }

    if let Some(error) = first_error {
        return Err(error);
    }

    indexed.sort_by_key(|(index, _)| *index);

    Ok(indexed)
}

/// The pieces of the final merge over concatenated intermediates: the first is taken whole (its
/// leading pad survives into the merge, to be trimmed by the caller), while every later
/// intermediate is range-copied from past its own pad.
fn merge_pieces(intermediates: &[(usize, ObjectRef)], pad: u64) -> Vec<Piece> {
    intermediates
        .iter()
        .enumerate()
        .map(|(index, (_, object))| {
            if index == 0 {
                Piece::Whole {
                    bucket: object.bucket.clone(),
                    key: object.key.clone(),
                    size: object.size,
                }
            } else {
                Piece::Range {
                    bucket: object.bucket.clone(),
                    key: object.key.clone(),
                    range: pad..object.size,
                }
            }
        })
        .collect()
}
