//! End-to-end tests of the archive assembly engine, running against the strict in-memory store
//! in [`crate::store`].
//!
//! These exercise the real public API: enumerate sources, build the job, run it, then read the
//! finished object back and feed it to an actual tar reader.  The mock store enforces the
//! multipart upload rules (minimum part size, part count ceiling, valid copy ranges), so the
//! engine can't pass these tests by producing an upload a real endpoint would reject.
use crate::store::MockStore;
use rand::{Rng, SeedableRng};
use ssscat::{
    ArchiveDestination, ArchiveSource, Config, CreateArchiveJobBuilder, CreateProgressCallback,
    ObjectRef, ObjectStore, S3CatError,
};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const MIB: usize = 1024 * 1024;

const SRC_BUCKET: &str = "src-bucket";
const DST_BUCKET: &str = "dst-bucket";
const DST_PREFIX: &str = "archives";
const DST_KEY: &str = "backup.tar";

/// Seed source objects with deterministic pseudo-random contents, returning the contents by key.
fn seed_objects(store: &MockStore, specs: &[(&str, usize)]) -> HashMap<String, Vec<u8>> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5ca7);

    let mut data_by_key = HashMap::new();
    for (key, size) in specs {
        let mut data = vec![0u8; *size];
        rng.fill(&mut data[..]);

        store.put_object(SRC_BUCKET, key, data.clone());
        data_by_key.insert(key.to_string(), data);
    }

    data_by_key
}

fn destination() -> ArchiveDestination {
    ArchiveDestination {
        bucket: DST_BUCKET.to_string(),
        prefix: DST_PREFIX.to_string(),
        key: DST_KEY.to_string(),
    }
}

fn prefix_source() -> ArchiveSource {
    ArchiveSource::Prefix {
        bucket: SRC_BUCKET.to_string(),
        prefix: "data/".to_string(),
    }
}

async fn run_archive(
    store: &Arc<MockStore>,
    config: Config,
    source: ArchiveSource,
) -> ssscat::Result<ObjectRef> {
    let job = CreateArchiveJobBuilder::new(config, source, destination())
        .store(store.clone() as Arc<dyn ObjectStore>)
        .build()
        .await?;

    job.run_without_progress(std::future::pending()).await
}

/// Parse the archive with a real tar reader, returning `(path, contents)` in archive order.
fn parse_archive(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(bytes));

    archive
        .entries()
        .expect("archive has a valid entry stream")
        .map(|entry| {
            let mut entry = entry.expect("entry is readable");
            let path = entry.path().unwrap().display().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (path, data)
        })
        .collect()
}

/// The structural tar properties every finished archive must have: block alignment and a zero
/// trailer of at least two blocks.
fn assert_tar_invariants(bytes: &[u8]) {
    assert_eq!(bytes.len() % 512, 0, "archive is not block aligned");
    assert!(bytes.len() >= 1024);
    assert!(
        bytes[bytes.len() - 1024..].iter().all(|&b| b == 0),
        "archive does not end with two zero blocks"
    );
}

/// After a successful run: no scratch objects, no temp object, no open uploads, and every upload
/// stayed within the store's part count ceiling.
fn assert_clean_run(store: &MockStore) {
    assert_eq!(store.open_upload_count(), 0, "uploads left open");

    assert_eq!(
        store.object_keys(DST_BUCKET, "archives/parts"),
        Vec::<String>::new(),
        "scratch objects left under parts/"
    );
    assert_eq!(
        store.object_keys(DST_BUCKET, "archives/headers"),
        Vec::<String>::new(),
        "scratch objects left under headers/"
    );
    assert!(
        store.get_object(DST_BUCKET, "archives/backup.tar.temp").is_none(),
        "pre-redistribution temp object left behind"
    );

    let stats = store.stats();
    assert!(stats.max_parts_in_one_upload <= ssscat::objstore::MAX_PARTS_PER_UPLOAD);
    assert_eq!(
        stats.uploads_created,
        stats.uploads_completed + stats.uploads_aborted
    );
}

/// Every source object's bytes appear in the archive exactly as stored, under its own key, in
/// the given order, after the synthetic manifest entry.
fn assert_archive_contents(
    bytes: &[u8],
    expected_keys: &[&str],
    data_by_key: &HashMap<String, Vec<u8>>,
) {
    let entries = parse_archive(bytes);

    assert_eq!(entries.len(), expected_keys.len() + 1);
    assert_eq!(entries[0].0, "manifest.csv");

    for ((path, data), expected_key) in entries[1..].iter().zip(expected_keys) {
        assert_eq!(path, expected_key);
        assert_eq!(
            data,
            &data_by_key[*expected_key],
            "payload bytes of '{expected_key}' differ from the source object"
        );
    }
}

/// Three objects below the minimum part size force the small-file path; the result must still be
/// a byte-perfect tar archive.
#[tokio::test]
async fn small_file_path_builds_valid_archive() -> crate::Result<()> {
    let store = Arc::new(MockStore::new());
    let data = seed_objects(
        &store,
        &[
            ("data/000.bin", 4 * MIB),
            ("data/001.bin", 4 * MIB),
            ("data/002.bin", 4 * MIB),
        ],
    );

    let archive = run_archive(&store, Config::default(), prefix_source()).await?;

    assert_eq!(archive.bucket, DST_BUCKET);
    assert_eq!(archive.key, "archives/backup.tar");

    let bytes = store
        .get_object(DST_BUCKET, "archives/backup.tar")
        .expect("final archive object exists");
    assert_eq!(bytes.len() as u64, archive.size);

    assert_tar_invariants(&bytes);
    assert_archive_contents(
        &bytes,
        &["data/000.bin", "data/001.bin", "data/002.bin"],
        &data,
    );
    assert_clean_run(&store);

    // The payloads plus headers and trailer, and nothing else (in particular, no leading pad)
    assert!(bytes.len() > 12 * MIB);
    assert!(bytes.len() < 12 * MIB + 16 * 512);

    // Headers went up as literal parts, payloads as server-side copies
    let stats = store.stats();
    assert!(stats.parts_uploaded > 0);
    assert!(stats.parts_copied > 0);

    Ok(())
}

/// The synthetic manifest is the first entry and lists every input with its bucket, key, and
/// size.
#[tokio::test]
async fn manifest_entry_lists_inputs() -> crate::Result<()> {
    let store = Arc::new(MockStore::new());
    seed_objects(
        &store,
        &[("data/000.bin", 4 * MIB), ("data/001.bin", 2 * MIB)],
    );

    run_archive(&store, Config::default(), prefix_source()).await?;

    let bytes = store.get_object(DST_BUCKET, "archives/backup.tar").unwrap();
    let entries = parse_archive(&bytes);

    let manifest = std::str::from_utf8(&entries[0].1)?.to_string();
    let records = manifest.lines().collect::<Vec<_>>();

    // One record per input; the manifest does not list itself
    assert_eq!(records.len(), 2);
    assert!(records[0].starts_with(&format!("{SRC_BUCKET},data/000.bin,{},", 4 * MIB)));
    assert!(records[1].starts_with(&format!("{SRC_BUCKET},data/001.bin,{},", 2 * MIB)));

    Ok(())
}

/// Objects all at or above the minimum part size take the large-file path: pair intermediates,
/// an oversized temp object, and a redistribution pass.  Observably it's the same valid archive
/// with everything swept.
#[tokio::test]
async fn large_file_path_builds_valid_archive() -> crate::Result<()> {
    let store = Arc::new(MockStore::new());
    let data = seed_objects(
        &store,
        &[("data/000.bin", 8 * MIB), ("data/001.bin", 8 * MIB + 700)],
    );

    let archive = run_archive(&store, Config::default(), prefix_source()).await?;

    let bytes = store.get_object(DST_BUCKET, "archives/backup.tar").unwrap();
    assert_eq!(bytes.len() as u64, archive.size);

    assert_tar_invariants(&bytes);
    assert_archive_contents(&bytes, &["data/000.bin", "data/001.bin"], &data);
    assert_clean_run(&store);

    Ok(())
}

/// A total below the store's 5 MiB floor is rejected before anything touches the store.
#[tokio::test]
async fn total_below_minimum_is_an_input_error() -> crate::Result<()> {
    let store = Arc::new(MockStore::new());
    seed_objects(&store, &[("data/000.bin", 4 * MIB)]);

    let result = CreateArchiveJobBuilder::new(Config::default(), prefix_source(), destination())
        .store(store.clone() as Arc<dyn ObjectStore>)
        .build()
        .await;

    assert!(matches!(
        result.unwrap_err(),
        S3CatError::TotalSizeTooSmall { .. }
    ));
    assert_eq!(store.stats().uploads_created, 0, "no multipart upload may be opened");

    Ok(())
}

/// Progress callback that counts assembled batches.
struct CountBatches(Arc<AtomicUsize>);

impl CreateProgressCallback for CountBatches {
    fn batch_assembled(&self, _index: usize, _size: u64) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A pile of objects far below the minimum part size: the plan is batched into several groups,
/// and the part-size law holds in every multipart upload the engine issues (the mock rejects
/// violations outright).
#[tokio::test]
async fn small_objects_are_batched_into_groups() -> crate::Result<()> {
    let store = Arc::new(MockStore::new());

    let specs = (0..12)
        .map(|i| (format!("data/{i:04}.bin"), MIB))
        .collect::<Vec<_>>();
    let spec_refs = specs
        .iter()
        .map(|(key, size)| (key.as_str(), *size))
        .collect::<Vec<_>>();
    let data = seed_objects(&store, &spec_refs);

    // A small batch target so the run actually exercises multiple groups
    let config = Config::default().with_batch_size(5 * MIB as u64);

    let batches = Arc::new(AtomicUsize::new(0));
    let job = CreateArchiveJobBuilder::new(config, prefix_source(), destination())
        .store(store.clone() as Arc<dyn ObjectStore>)
        .build()
        .await?;
    assert_eq!(job.total_objects(), 12);

    job.run(
        std::future::pending(),
        CountBatches(batches.clone()),
    )
    .await?;

    assert!(
        batches.load(Ordering::SeqCst) >= 2,
        "expected the plan to be split into multiple batches"
    );

    let bytes = store.get_object(DST_BUCKET, "archives/backup.tar").unwrap();
    assert_tar_invariants(&bytes);

    let expected_keys = specs.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>();
    assert_archive_contents(&bytes, &expected_keys, &data);
    assert_clean_run(&store);

    Ok(())
}

/// Keys longer than the ustar name fields survive via the long-name extension.
#[tokio::test]
async fn long_object_keys_survive_archiving() -> crate::Result<()> {
    let store = Arc::new(MockStore::new());

    let long_key = format!("data/{}", "k".repeat(120));
    let longer_key = format!("data/{}/{}", "d".repeat(150), "f".repeat(130));
    let data = seed_objects(
        &store,
        &[
            ("data/big.bin", 5 * MIB),
            (long_key.as_str(), 700),
            (longer_key.as_str(), 1024),
        ],
    );

    run_archive(&store, Config::default(), prefix_source()).await?;

    let bytes = store.get_object(DST_BUCKET, "archives/backup.tar").unwrap();
    assert_tar_invariants(&bytes);

    let mut expected_keys = vec!["data/big.bin", long_key.as_str(), longer_key.as_str()];
    expected_keys.sort();
    assert_archive_contents(&bytes, &expected_keys, &data);
    assert_clean_run(&store);

    Ok(())
}

/// Zero-length source objects become header-only entries.
#[tokio::test]
async fn zero_length_entries_are_archived() -> crate::Result<()> {
    let store = Arc::new(MockStore::new());
    let data = seed_objects(
        &store,
        &[
            ("data/000.bin", 5 * MIB),
            ("data/001-empty.bin", 0),
            ("data/002.bin", 100),
        ],
    );

    run_archive(&store, Config::default(), prefix_source()).await?;

    let bytes = store.get_object(DST_BUCKET, "archives/backup.tar").unwrap();
    assert_tar_invariants(&bytes);
    assert_archive_contents(
        &bytes,
        &["data/000.bin", "data/001-empty.bin", "data/002.bin"],
        &data,
    );
    assert_clean_run(&store);

    Ok(())
}

/// A CSV manifest selects the sources and fixes their order; records without sizes are completed
/// via HeadObject.
#[tokio::test]
async fn manifest_source_preserves_manifest_order() -> crate::Result<()> {
    let store = Arc::new(MockStore::new());
    let data = seed_objects(
        &store,
        &[
            ("data/000.bin", 4 * MIB),
            ("data/001.bin", 4 * MIB),
            ("data/002.bin", 64 * 1024),
        ],
    );

    // Deliberately not in listing order, with a header row and a record that omits the size
    let mut manifest = tempfile::NamedTempFile::new()?;
    writeln!(manifest, "bucket,key,size,etag")?;
    writeln!(manifest, "{SRC_BUCKET},data/002.bin,{}", 64 * 1024)?;
    writeln!(manifest, "{SRC_BUCKET},data/000.bin")?;
    writeln!(manifest, "{SRC_BUCKET},data/001.bin,{},", 4 * MIB)?;
    manifest.flush()?;

    let source = ArchiveSource::Manifest {
        path: manifest.path().to_path_buf(),
        skip_header: true,
    };

    run_archive(&store, Config::default(), source).await?;

    let bytes = store.get_object(DST_BUCKET, "archives/backup.tar").unwrap();
    assert_tar_invariants(&bytes);
    assert_archive_contents(
        &bytes,
        &["data/002.bin", "data/000.bin", "data/001.bin"],
        &data,
    );
    assert_clean_run(&store);

    Ok(())
}

/// Progress callback that fires an abort signal as soon as the first batch lands.
struct CancelOnFirstBatch(Mutex<Option<tokio::sync::oneshot::Sender<()>>>);

impl CreateProgressCallback for CancelOnFirstBatch {
    fn batch_assembled(&self, _index: usize, _size: u64) {
        if let Some(sender) = self.0.lock().unwrap().take() {
            let _ = sender.send(());
        }
    }
}

/// Cancelling mid-run stops the job with an error, leaves no final object, and leaves no
/// multipart upload open — everything in flight is either completed or aborted.
#[tokio::test]
async fn cancellation_leaves_no_open_uploads() -> crate::Result<()> {
    let store = Arc::new(MockStore::new());

    let specs = (0..12)
        .map(|i| (format!("data/{i:04}.bin"), MIB))
        .collect::<Vec<_>>();
    let spec_refs = specs
        .iter()
        .map(|(key, size)| (key.as_str(), *size))
        .collect::<Vec<_>>();
    seed_objects(&store, &spec_refs);

    // Serialize the batches so work is guaranteed to remain when the first batch triggers the
    // abort
    let config = Config::default()
        .with_batch_size(5 * MIB as u64)
        .with_max_concurrent_parts(1);

    let job = CreateArchiveJobBuilder::new(config, prefix_source(), destination())
        .store(store.clone() as Arc<dyn ObjectStore>)
        .build()
        .await?;

    let (sender, receiver) = tokio::sync::oneshot::channel::<()>();
    let abort = async move {
        let _ = receiver.await;
    };

    let result = job
        .run(abort, CancelOnFirstBatch(Mutex::new(Some(sender))))
        .await;

    assert!(matches!(result.unwrap_err(), S3CatError::Aborted));
    assert!(
        store.get_object(DST_BUCKET, "archives/backup.tar").is_none(),
        "no final object may exist after cancellation"
    );
    assert_eq!(store.open_upload_count(), 0, "uploads left open");

    // Scratch objects are allowed to remain for later sweeping
    let stats = store.stats();
    assert_eq!(
        stats.uploads_created,
        stats.uploads_completed + stats.uploads_aborted
    );

    Ok(())
}

/// A store that starts failing mid-run: the first error is surfaced, in-flight uploads are
/// wound down and aborted, and scratch objects stay behind for diagnosis.
#[tokio::test]
async fn store_failure_aborts_open_uploads() -> crate::Result<()> {
    let store = Arc::new(MockStore::new());
    seed_objects(
        &store,
        &[
            ("data/000.bin", 4 * MIB),
            ("data/001.bin", 4 * MIB),
            ("data/002.bin", 4 * MIB),
        ],
    );

    // Let the pad object and a couple of merge steps through, then fail every new upload
    store.fail_creates_after_completes(3);

    let result = run_archive(&store, Config::default(), prefix_source()).await;

    assert!(matches!(
        result.unwrap_err(),
        S3CatError::StoreRejected { .. }
    ));
    assert!(store.get_object(DST_BUCKET, "archives/backup.tar").is_none());
    assert_eq!(store.open_upload_count(), 0, "uploads left open");

    let stats = store.stats();
    assert_eq!(
        stats.uploads_created,
        stats.uploads_completed + stats.uploads_aborted
    );

    Ok(())
}
