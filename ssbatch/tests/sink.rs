//! Tests for the tar archive sink in isolation, feeding it objects directly.
use assert_matches::assert_matches;
use chrono::Utc;
use ssbatch::{ArchiveSink, BatchTransferError, Config, FetchedObject, TarArchiveSink};
use ssbatch_testing::mem::{FailingBody, InMemoryBucket};
use ssbatch_testing::{logging, tar};
use std::collections::HashMap;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

fn object(key: &str, data: Vec<u8>) -> FetchedObject {
    FetchedObject {
        key: key.to_string(),
        size: data.len() as u64,
        last_modified: Utc::now(),
        body: Box::new(std::io::Cursor::new(data)),
    }
}

fn sink(dest: &InMemoryBucket, prefix: &str, config: &Config) -> TarArchiveSink {
    TarArchiveSink::new(Box::new(dest.clone()), prefix.to_string(), config)
}

/// Feed the given objects through a channel to the sink, the way the fan-out stage would.
async fn archive(
    sink: &TarArchiveSink,
    batch_index: usize,
    objects: Vec<FetchedObject>,
) -> Result<ssbatch::ArchiveSummary, BatchTransferError> {
    let (sender, receiver) = mpsc::channel(1);

    let feeder = tokio::spawn(async move {
        for object in objects {
            if sender.send(object).await.is_err() {
                break;
            }
        }
    });

    let result = sink.archive_batch(batch_index, receiver).await;

    feeder.await.unwrap();

    result
}

#[tokio::test]
async fn plain_tar_round_trip() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let dest = InMemoryBucket::new("dest");
    let sink = sink(&dest, "archives/", &Config::default());

    let expected: HashMap<String, Vec<u8>> = [
        ("a/first.dat".to_string(), vec![1u8; 100]),
        ("a/second.dat".to_string(), vec![2u8; 2000]),
        ("third.dat".to_string(), Vec::new()),
    ]
    .into_iter()
    .collect();

    let objects = expected
        .iter()
        .map(|(key, data)| object(key, data.clone()))
        .collect::<Vec<_>>();

    let summary = archive(&sink, 7, objects).await?;

    assert_eq!(summary.objects, 3);
    assert_eq!(summary.total_object_bytes, 2100);
    assert!(summary.key.starts_with("archives/batch-00000007-"));
    assert!(summary.key.ends_with(".tar"));

    let uploads = dest.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].key, summary.key);
    assert_eq!(uploads[0].data.len() as u64, summary.archive_bytes);

    let entries = tar::archive_entries(&uploads[0].data, false)?;
    assert_eq!(entries, expected);

    Ok(())
}

#[tokio::test]
async fn gzip_compresses_the_archive() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let dest = InMemoryBucket::new("dest");
    let config = Config {
        compress: true,
        ..Default::default()
    };
    let sink = sink(&dest, "", &config);

    // Highly compressible data so the compression is visible in the sizes
    let data = vec![0u8; 64 * 1024];
    let summary = archive(&sink, 0, vec![object("zeros.dat", data.clone())]).await?;

    assert!(summary.key.ends_with(".tar.gz"));
    assert!(summary.archive_bytes < summary.total_object_bytes);

    let entries = tar::archive_entries(&dest.uploads()[0].data, true)?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries["zeros.dat"], data);

    Ok(())
}

#[tokio::test]
async fn disk_spool_round_trip() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let dest = InMemoryBucket::new("dest");
    let config = Config {
        in_memory: false,
        ..Default::default()
    };
    let sink = sink(&dest, "", &config);

    let data = vec![42u8; 10 * 1024];
    let summary = archive(&sink, 0, vec![object("answer.dat", data.clone())]).await?;

    assert_eq!(summary.objects, 1);

    let entries = tar::archive_entries(&dest.uploads()[0].data, false)?;
    assert_eq!(entries["answer.dat"], data);

    Ok(())
}

#[tokio::test]
async fn failed_body_read_fails_the_batch() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let dest = InMemoryBucket::new("dest");
    let sink = sink(&dest, "", &Config::default());

    let broken = FetchedObject {
        key: "broken.dat".to_string(),
        size: 100,
        last_modified: Utc::now(),
        body: Box::new(FailingBody::new(vec![9u8; 10])) as Box<dyn AsyncRead + Send + Unpin>,
    };

    let result = archive(&sink, 0, vec![object("ok.dat", vec![1u8; 10]), broken]).await;

    assert_matches!(result, Err(BatchTransferError::TarAppendData { .. }));
    assert!(dest.uploads().is_empty());

    Ok(())
}

#[tokio::test]
async fn failed_body_read_is_skipped_when_tolerated() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let dest = InMemoryBucket::new("dest");
    let config = Config {
        skip_errors: true,
        ..Default::default()
    };
    let sink = sink(&dest, "", &config);

    let broken = FetchedObject {
        key: "broken.dat".to_string(),
        size: 100,
        last_modified: Utc::now(),
        body: Box::new(FailingBody::new(vec![9u8; 10])) as Box<dyn AsyncRead + Send + Unpin>,
    };

    let summary = archive(
        &sink,
        0,
        vec![
            object("ok.dat", vec![1u8; 10]),
            broken,
            object("also-ok.dat", vec![2u8; 20]),
        ],
    )
    .await?;

    assert_eq!(summary.objects, 2);

    let entries = tar::archive_entries(&dest.uploads()[0].data, false)?;
    assert_eq!(entries.len(), 2);
    assert!(!entries.contains_key("broken.dat"));

    Ok(())
}

#[tokio::test]
async fn failed_upload_fails_the_batch() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let dest = InMemoryBucket::new("dest");
    dest.fail_uploads();

    let sink = sink(&dest, "", &Config::default());

    let result = archive(&sink, 0, vec![object("doomed.dat", vec![1u8; 10])]).await;

    assert_matches!(result, Err(BatchTransferError::UploadArchive { .. }));

    Ok(())
}

/// A batch whose every object was dropped ends up with nothing to archive; no upload happens.
#[tokio::test]
async fn empty_batch_uploads_nothing() -> ssbatch_testing::Result<()> {
    logging::init_test_logging();

    let dest = InMemoryBucket::new("dest");
    let sink = sink(&dest, "", &Config::default());

    let summary = archive(&sink, 0, Vec::new()).await?;

    assert_eq!(summary.objects, 0);
    assert_eq!(summary.archive_bytes, 0);
    assert!(dest.uploads().is_empty());

    Ok(())
}
