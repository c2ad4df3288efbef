//! Progress reporting for interactive terminal sessions.
use indicatif::{ProgressBar, ProgressStyle};
use ssbatch::{ArchiveSummary, BatchTransferError, TransferProgressCallback};
use std::time::Duration;

/// Renders transfer progress as a live spinner counting copied objects.
///
/// Cloning shares the underlying progress bar, so one clone can be handed to the transfer job
/// while the caller keeps another to finish the display afterwards.
#[derive(Clone)]
pub(crate) struct TransferProgressReport {
    objects: ProgressBar,
}

impl TransferProgressReport {
    /// Create the report, hidden entirely when `hidden` is set (quiet mode, or verbose mode
    /// where the spinner would interleave badly with log output).
    pub(crate) fn new(hidden: bool) -> Self {
        let objects = if hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };

        objects.set_style(
            ProgressStyle::with_template("{spinner} {pos} objects copied {msg}")
                .expect("BUG: invalid progress template"),
        );
        objects.enable_steady_tick(Duration::from_millis(100));

        Self { objects }
    }

    pub(crate) fn finish(&self) {
        self.objects.finish_and_clear();
    }
}

impl TransferProgressCallback for TransferProgressReport {
    fn listing_error(&self, error: &BatchTransferError) {
        self.objects.println(format!("listing error: {error}"));
    }

    fn object_fetched(&self, _key: &str, _size: u64) {
        self.objects.inc(1);
    }

    fn object_skipped(&self, key: &str, error: &BatchTransferError) {
        self.objects.println(format!("skipping {key}: {error}"));
    }

    fn batch_uploaded(&self, batch_index: usize, summary: &ArchiveSummary, elapsed: Duration) {
        let size = byte_unit::Byte::from_bytes(summary.archive_bytes as u128)
            .get_appropriate_unit(true);

        self.objects.set_message(format!(
            "(batch {} -> {} [{}] in {:0.2?})",
            batch_index, summary.key, size, elapsed
        ));
    }
}
