//! Groups the listing stream into fixed-size batches.
use crate::objstore::ObjectDescriptor;
use crate::transfer::TransferProgressCallback;
use crate::Result;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::warn;

/// Pulls object descriptors from a lazy listing stream and groups them into batches of at most
/// `batch_size` objects.
///
/// The stream is only polled when the next batch is requested, so listing proceeds in lock-step
/// with the rest of the pipeline rather than racing ahead of it.  A failed listing item is logged
/// and skipped; it reduces the batch by one object but never ends the run.
pub(crate) struct Batcher {
    objects: BoxStream<'static, Result<ObjectDescriptor>>,
    batch_size: usize,
    exhausted: bool,
}

impl Batcher {
    pub(crate) fn new(
        objects: BoxStream<'static, Result<ObjectDescriptor>>,
        batch_size: usize,
    ) -> Self {
        Self {
            objects,
            batch_size,
            exhausted: false,
        }
    }

    /// Produce the next batch of up to `batch_size` objects, or `None` once the listing is
    /// exhausted.
    ///
    /// The final batch is usually smaller than `batch_size`; it's never empty.
    pub(crate) async fn next_batch(
        &mut self,
        progress: &dyn TransferProgressCallback,
    ) -> Option<Vec<ObjectDescriptor>> {
        if self.exhausted {
            return None;
        }

        let mut batch = Vec::with_capacity(self.batch_size);

        while batch.len() < self.batch_size {
            match self.objects.next().await {
                Some(Ok(descriptor)) => batch.push(descriptor),
                Some(Err(error)) => {
                    warn!(%error, "skipping a listing entry that could not be read");
                    progress.listing_error(&error);
                }
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }

        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}
