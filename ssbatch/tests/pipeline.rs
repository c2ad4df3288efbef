//! End-to-end tests driving the whole transfer pipeline against in-memory buckets.
use assert_matches::assert_matches;
use more_asserts::{assert_ge, assert_le};
use ssbatch::{
    ArchiveSink, ArchiveSummary, BatchTransferError, Config, FetchedObject, Result,
    TarArchiveSink, TransferJob,
};
use ssbatch_testing::mem::InMemoryBucket;
use ssbatch_testing::{logging, tar};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Wire a transfer from `source` (with `prefix`) to a tar archive sink on `dest`.
fn tar_job(
    config: Config,
    source: &InMemoryBucket,
    prefix: &str,
    dest: &InMemoryBucket,
    dest_prefix: &str,
) -> Result<TransferJob> {
    let sink = TarArchiveSink::new(
        Box::new(dest.clone()),
        dest_prefix.to_string(),
        &config,
    );

    TransferJob::new(
        config,
        Box::new(source.clone()),
        prefix.to_string(),
        Box::new(sink),
    )
}

#[tokio::test]
async fn round_trip_two_objects() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let source = InMemoryBucket::new("source");
    let dest = InMemoryBucket::new("dest");
    let expected = source.populate("data/", 2, 1024);

    let job = tar_job(Config::default(), &source, "data/", &dest, "archives/")?;
    let summary = job.run_without_progress().await?;

    assert_eq!(summary.total_objects, 2);
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.total_bytes, 2 * 1024);

    let uploads = dest.uploads();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].key.starts_with("archives/batch-00000000-"));
    assert!(uploads[0].key.ends_with(".tar"));

    let entries = tar::archive_entries(&uploads[0].data, false)?;
    assert_eq!(entries, expected);

    Ok(())
}

#[tokio::test]
async fn gzip_round_trip() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let source = InMemoryBucket::new("source");
    let dest = InMemoryBucket::new("dest");
    let expected = source.populate("", 5, 512);

    let config = Config {
        compress: true,
        ..Default::default()
    };

    let job = tar_job(config, &source, "", &dest, "")?;
    let summary = job.run_without_progress().await?;

    assert_eq!(summary.total_objects, 5);

    let uploads = dest.uploads();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].key.ends_with(".tar.gz"));

    let entries = tar::archive_entries(&uploads[0].data, true)?;
    assert_eq!(entries, expected);

    Ok(())
}

#[tokio::test]
async fn empty_source_uploads_nothing() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let source = InMemoryBucket::new("source");
    let dest = InMemoryBucket::new("dest");

    let job = tar_job(Config::default(), &source, "", &dest, "")?;
    let summary = job.run_without_progress().await?;

    assert_eq!(summary, Default::default());
    assert!(dest.uploads().is_empty());

    Ok(())
}

#[tokio::test]
async fn failed_fetch_drops_only_that_object() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let source = InMemoryBucket::new("source");
    let dest = InMemoryBucket::new("dest");
    let mut expected = source.populate("", 10, 256);

    // This object's fetch fails; all nine others still make it into the archive
    source.fail_fetch("object-00003.dat");
    expected.remove("object-00003.dat");

    let job = tar_job(Config::default(), &source, "", &dest, "")?;
    let summary = job.run_without_progress().await?;

    assert_eq!(summary.total_objects, 9);
    assert_eq!(summary.batches, 1);

    let uploads = dest.uploads();
    assert_eq!(uploads.len(), 1);

    let entries = tar::archive_entries(&uploads[0].data, false)?;
    assert_eq!(entries, expected);

    Ok(())
}

#[tokio::test]
async fn listing_fault_skips_nothing_else() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let source = InMemoryBucket::new("source");
    let dest = InMemoryBucket::new("dest");
    let expected = source.populate("", 5, 128);

    source.inject_listing_error(2);

    let job = tar_job(Config::default(), &source, "", &dest, "")?;
    let summary = job.run_without_progress().await?;

    assert_eq!(summary.total_objects, 5);

    let entries = tar::archive_entries(&dest.uploads()[0].data, false)?;
    assert_eq!(entries, expected);

    Ok(())
}

#[tokio::test]
async fn failed_upload_fails_the_transfer() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let source = InMemoryBucket::new("source");
    let dest = InMemoryBucket::new("dest");
    source.populate("", 3, 128);

    dest.fail_uploads();

    let job = tar_job(Config::default(), &source, "", &dest, "")?;
    let result = job.run_without_progress().await;

    assert_matches!(result, Err(BatchTransferError::UploadArchive { .. }));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_concurrency_is_bounded() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    const CONCURRENCY: usize = 4;

    let source = InMemoryBucket::new("source");
    let dest = InMemoryBucket::new("dest");
    source.populate("", 30, 64);

    // Stretch each fetch out so overlapping fetches are actually observable
    source.set_fetch_delay(Duration::from_millis(10));

    let config = Config {
        concurrency: Some(CONCURRENCY),
        ..Default::default()
    };

    let job = tar_job(config, &source, "", &dest, "")?;
    let summary = job.run_without_progress().await?;

    assert_eq!(summary.total_objects, 30);
    assert_le!(source.peak_concurrent_fetches(), CONCURRENCY);
    assert_ge!(source.peak_concurrent_fetches(), 2);

    Ok(())
}

/// A sink that records what it was given, used to observe batch boundaries and sequencing
/// without involving tar at all.
#[derive(Debug, Default)]
struct SinkState {
    batches: Mutex<Vec<Vec<String>>>,
    active: AtomicBool,
    overlapped: AtomicBool,
}

#[derive(Clone, Debug)]
struct RecordingSink {
    state: Arc<SinkState>,
}

#[async_trait::async_trait]
impl ArchiveSink for RecordingSink {
    async fn archive_batch(
        &self,
        batch_index: usize,
        mut objects: mpsc::Receiver<FetchedObject>,
    ) -> Result<ArchiveSummary> {
        if self.state.active.swap(true, Ordering::SeqCst) {
            self.state.overlapped.store(true, Ordering::SeqCst);
        }

        let mut keys = Vec::new();
        let mut bytes = 0u64;

        while let Some(object) = objects.recv().await {
            bytes += object.size;
            keys.push(object.key);
        }

        // Linger a little after the channel closes, to catch a driver that starts the next
        // batch before this one's sink call has returned
        tokio::time::sleep(Duration::from_millis(2)).await;

        let summary = ArchiveSummary {
            key: format!("recorded-{batch_index:08}"),
            objects: keys.len(),
            total_object_bytes: bytes,
            archive_bytes: bytes,
        };

        self.state.batches.lock().unwrap().push(keys);
        self.state.active.store(false, Ordering::SeqCst);

        Ok(summary)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn batches_are_sized_and_sequential() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let source = InMemoryBucket::new("source");
    let expected = source.populate("", 250, 32);

    let state = Arc::new(SinkState::default());
    let sink = RecordingSink {
        state: state.clone(),
    };

    let job = TransferJob::new(
        Config::default(),
        Box::new(source.clone()),
        String::new(),
        Box::new(sink),
    )?;

    let summary = job.run_without_progress().await?;

    assert_eq!(summary.total_objects, 250);
    assert_eq!(summary.batches, 3);

    let batches = state.batches.lock().unwrap();
    assert_eq!(
        batches.iter().map(|batch| batch.len()).collect::<Vec<_>>(),
        vec![100, 100, 50]
    );

    // Every object arrived exactly once, in some order within its batch
    let mut seen = batches.iter().flatten().cloned().collect::<Vec<_>>();
    seen.sort();
    let mut expected_keys = expected.keys().cloned().collect::<Vec<_>>();
    expected_keys.sort();
    assert_eq!(seen, expected_keys);

    assert!(
        !state.overlapped.load(Ordering::SeqCst),
        "batches must be processed strictly one at a time"
    );

    Ok(())
}

#[tokio::test]
async fn zero_batch_size_is_rejected() {
    let source = InMemoryBucket::new("source");
    let dest = InMemoryBucket::new("dest");

    let config = Config {
        batch_size: 0,
        ..Default::default()
    };

    assert_matches!(
        tar_job(config, &source, "", &dest, ""),
        Err(BatchTransferError::InvalidBatchSize)
    );
}

#[tokio::test]
async fn zero_concurrency_is_rejected() {
    let source = InMemoryBucket::new("source");
    let dest = InMemoryBucket::new("dest");

    let config = Config {
        concurrency: Some(0),
        ..Default::default()
    };

    assert_matches!(
        tar_job(config, &source, "", &dest, ""),
        Err(BatchTransferError::InvalidConcurrency)
    );
}
