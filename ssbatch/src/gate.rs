//! Admission control for concurrent fetch jobs.
//!
//! Every in-flight fetch holds an open connection to the source plus a transfer buffer, so the
//! number of simultaneously running fetch jobs needs a hard upper bound.  [`JobGate`] provides
//! that bound, plus a barrier that lets the fan-out stage wait until every job it launched has
//! finished before it closes the handoff channel.
use crate::{error, Result};
use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A counting gate limiting how many fetch jobs run concurrently.
///
/// Cloning is cheap; all clones share the same permit pool.
#[derive(Clone, Debug)]
pub struct JobGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Proof that a job holds one of the gate's permits.
///
/// The permit is released when this value is dropped, on every exit path.
#[derive(Debug)]
pub struct JobPermit {
    _permit: OwnedSemaphorePermit,
}

impl JobGate {
    /// Create a gate that admits up to `capacity` concurrent jobs.
    ///
    /// Fails if `capacity` is zero; a gate that admits nothing would deadlock the first caller.
    pub fn new(capacity: usize) -> Result<Self> {
        ensure!(capacity > 0, error::InvalidConcurrencySnafu);

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until a permit is available, then claim it.
    pub async fn acquire(&self) -> JobPermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("BUG: the gate semaphore is never closed");

        JobPermit { _permit: permit }
    }

    /// Block until every permit acquired so far has been released.
    ///
    /// Implemented by briefly claiming the entire permit pool, which is only possible once no job
    /// holds a permit.  Returns immediately if nothing was ever acquired.  Callers must stop
    /// acquiring before waiting, otherwise the barrier competes with the jobs it is waiting for.
    pub async fn wait_idle(&self) {
        let all_permits = self
            .semaphore
            .acquire_many(self.capacity as u32)
            .await
            .expect("BUG: the gate semaphore is never closed");

        drop(all_permits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::BatchTransferError;
    use more_asserts::assert_le;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn zero_capacity_is_rejected() {
        assert_matches!(
            JobGate::new(0),
            Err(BatchTransferError::InvalidConcurrency)
        );
    }

    /// No matter how many jobs are launched, the number holding a permit at any instant never
    /// exceeds the gate's capacity.
    #[tokio::test]
    async fn permit_count_never_exceeds_capacity() {
        const CAPACITY: usize = 4;
        const JOBS: usize = 100;

        let gate = JobGate::new(CAPACITY).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..JOBS {
            let permit = gate.acquire().await;
            let running = running.clone();
            let peak = peak.clone();

            tokio::spawn(async move {
                let _permit = permit;

                let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now_running, Ordering::SeqCst);

                tokio::time::sleep(Duration::from_millis(1)).await;

                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        gate.wait_idle().await;

        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert_le!(peak.load(Ordering::SeqCst), CAPACITY);
        assert!(peak.load(Ordering::SeqCst) > 0);
    }

    /// `wait_idle` must not return while any job still holds a permit.
    #[tokio::test]
    async fn wait_idle_blocks_until_all_permits_released() {
        let gate = JobGate::new(2).unwrap();

        let permit = gate.acquire().await;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_idle().await })
        };

        // The waiter can't complete while the permit is outstanding
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(permit);

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("wait_idle did not complete after the last permit was released")
            .unwrap();
    }

    /// Waiting with zero acquired jobs is vacuously satisfied and returns immediately.
    #[tokio::test]
    async fn wait_idle_with_no_jobs_returns_immediately() {
        let gate = JobGate::new(8).unwrap();

        tokio::time::timeout(Duration::from_secs(1), gate.wait_idle())
            .await
            .expect("wait_idle should not block when no permits were acquired");

        // And the gate is still usable afterwards
        let _permit = gate.acquire().await;
    }
}
