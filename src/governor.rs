//! Memory budgeting and adaptive batch sizing for ingestion work.
//!
//! Batch sizes follow AIMD: a completed batch adds a fixed increment up to
//! the ceiling, an out-of-memory or over-budget batch halves down to the
//! floor. Admission reserves projected bytes against the budget; callers
//! either get a permit, wait for one, or are refused.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub max_memory_bytes: u64,
    pub initial_batch_size: usize,
    /// Additive step after a successful batch.
    pub batch_increment: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// Fixed per-item cost on top of the item's own bytes (embedding
    /// vector, tokenizer state, bookkeeping).
    pub item_overhead_bytes: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 1024 * 1024 * 1024,
            initial_batch_size: 32,
            batch_increment: 8,
            min_batch_size: 1,
            max_batch_size: 256,
            item_overhead_bytes: 16 * 1024,
        }
    }
}

/// How a batch ended, as far as sizing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Success,
    OutOfMemory,
    /// Admission refused the batch's projected memory.
    OverBudget,
}

/// Point-in-time view of the governor. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceBudget {
    pub max_memory_bytes: u64,
    /// Bytes reserved by outstanding permits.
    pub current_estimate_bytes: u64,
    pub recommended_batch_size: usize,
    /// Process resident set size, where the platform reports it.
    pub resident_bytes: Option<u64>,
}

/// Something whose in-memory cost can be projected before processing it.
pub trait MemoryFootprint {
    fn footprint_bytes(&self) -> u64;
}

impl MemoryFootprint for str {
    fn footprint_bytes(&self) -> u64 {
        self.len() as u64
    }
}

impl MemoryFootprint for String {
    fn footprint_bytes(&self) -> u64 {
        self.len() as u64
    }
}

impl<T: MemoryFootprint + ?Sized> MemoryFootprint for &T {
    fn footprint_bytes(&self) -> u64 {
        (**self).footprint_bytes()
    }
}

#[derive(Debug)]
pub struct ResourceGovernor {
    config: GovernorConfig,
    current_batch: AtomicUsize,
    reserved_bytes: AtomicU64,
    released: Notify,
}

/// Reserved memory, returned to the budget on drop.
#[derive(Debug)]
pub struct AdmissionPermit<'a> {
    governor: &'a ResourceGovernor,
    bytes: u64,
}

impl AdmissionPermit<'_> {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.governor
            .reserved_bytes
            .fetch_sub(self.bytes, Ordering::AcqRel);
        self.governor.released.notify_waiters();
    }
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            current_batch: AtomicUsize::new(initial_batch_size(&config)),
            reserved_bytes: AtomicU64::new(0),
            released: Notify::new(),
            config,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Projected bytes for processing `batch`.
    pub fn estimate_memory<T: MemoryFootprint>(&self, batch: &[T]) -> u64 {
        batch
            .iter()
            .map(|item| item.footprint_bytes() + self.config.item_overhead_bytes)
            .sum()
    }

    /// Replay `history` from the initial size and return the resulting
    /// batch size. Pure: does not touch the live state.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrecall::governor::{BatchOutcome, GovernorConfig, ResourceGovernor};
    ///
    /// let governor = ResourceGovernor::new(GovernorConfig {
    ///     initial_batch_size: 32,
    ///     batch_increment: 8,
    ///     ..GovernorConfig::default()
    /// });
    /// let history = [BatchOutcome::Success, BatchOutcome::OutOfMemory];
    /// assert_eq!(governor.next_batch_size(&history), 20);
    /// ```
    pub fn next_batch_size(&self, history: &[BatchOutcome]) -> usize {
        history
            .iter()
            .fold(initial_batch_size(&self.config), |size, &outcome| {
                self.step(size, outcome)
            })
    }

    /// Apply `outcome` to the live batch size and return the new size.
    pub fn record(&self, outcome: BatchOutcome) -> usize {
        let previous = self
            .current_batch
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                Some(self.step(size, outcome))
            })
            .unwrap_or_else(|size| size);
        let next = self.step(previous, outcome);
        if next < previous {
            debug!(?outcome, previous, next, "batch size reduced");
        }
        next
    }

    pub fn recommended_batch_size(&self) -> usize {
        self.current_batch.load(Ordering::Acquire)
    }

    fn step(&self, size: usize, outcome: BatchOutcome) -> usize {
        match outcome {
            BatchOutcome::Success => size
                .saturating_add(self.config.batch_increment)
                .min(self.config.max_batch_size),
            BatchOutcome::OutOfMemory | BatchOutcome::OverBudget => {
                (size / 2).max(self.config.min_batch_size)
            }
        }
    }

    /// Reserve `bytes` now or fail with `ResourceExhausted`.
    pub fn try_admit(&self, bytes: u64) -> Result<AdmissionPermit<'_>> {
        let max = self.config.max_memory_bytes;
        let reserved = self.reserved_bytes.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |reserved| {
                let next = reserved.checked_add(bytes)?;
                (next <= max).then_some(next)
            },
        );

        match reserved {
            Ok(_) => Ok(AdmissionPermit {
                governor: self,
                bytes,
            }),
            Err(reserved) => Err(Error::ResourceExhausted {
                requested: bytes,
                available: max.saturating_sub(reserved),
            }),
        }
    }

    /// Reserve `bytes`, waiting for outstanding permits to be released.
    ///
    /// A request larger than the whole budget can never succeed and is
    /// refused immediately.
    pub async fn admit(&self, bytes: u64) -> Result<AdmissionPermit<'_>> {
        if bytes > self.config.max_memory_bytes {
            return Err(Error::ResourceExhausted {
                requested: bytes,
                available: self.config.max_memory_bytes,
            });
        }

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not lost.
            released.as_mut().enable();

            match self.try_admit(bytes) {
                Ok(permit) => return Ok(permit),
                Err(_) => {
                    debug!(bytes, "admission queued until memory is released");
                    released.await;
                }
            }
        }
    }

    pub fn budget(&self) -> ResourceBudget {
        ResourceBudget {
            max_memory_bytes: self.config.max_memory_bytes,
            current_estimate_bytes: self.reserved_bytes.load(Ordering::Acquire),
            recommended_batch_size: self.recommended_batch_size(),
            resident_bytes: resident_set_bytes(),
        }
    }

    /// Process `items` in adaptively sized batches.
    ///
    /// Each batch is admitted against its projected memory. A batch that
    /// does not fit, or whose `op` returns `ResourceExhausted`, is halved
    /// and retried; other errors abort the run. Batches are processed in
    /// order and every item is handed to `op` exactly once on success.
    pub async fn run_batched<'a, T, F, Fut>(
        &self,
        items: &'a [T],
        mut op: F,
    ) -> Result<usize>
    where
        T: MemoryFootprint,
        F: FnMut(&'a [T]) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut offset = 0;
        let mut batches = 0;

        while offset < items.len() {
            let size = self.recommended_batch_size().min(items.len() - offset);
            let batch = &items[offset..offset + size];
            let projected = self.estimate_memory(batch);

            let permit = match self.try_admit(projected) {
                Ok(permit) => permit,
                Err(err) if size > self.config.min_batch_size => {
                    debug!(%err, size, "batch over budget, shrinking");
                    self.record(BatchOutcome::OverBudget);
                    continue;
                }
                // Smallest batch: wait for memory instead of shrinking.
                Err(_) => self.admit(projected).await?,
            };

            match op(batch).await {
                Ok(()) => {
                    drop(permit);
                    self.record(BatchOutcome::Success);
                    offset += size;
                    batches += 1;
                }
                Err(Error::ResourceExhausted { .. })
                    if size > self.config.min_batch_size =>
                {
                    drop(permit);
                    warn!(size, "batch ran out of memory, halving and retrying");
                    self.record(BatchOutcome::OutOfMemory);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(batches)
    }
}

fn initial_batch_size(config: &GovernorConfig) -> usize {
    config
        .initial_batch_size
        .min(config.max_batch_size)
        .max(config.min_batch_size)
        .max(1)
}

/// Resident set size from `/proc/self/statm`, on Linux only.
fn resident_set_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        const PAGE_SIZE: u64 = 4096;
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * PAGE_SIZE)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use parking_lot::Mutex;
    use proptest::prelude::*;

    use super::*;

    fn governor(max_memory_bytes: u64) -> ResourceGovernor {
        ResourceGovernor::new(GovernorConfig {
            max_memory_bytes,
            initial_batch_size: 16,
            batch_increment: 4,
            min_batch_size: 1,
            max_batch_size: 32,
            item_overhead_bytes: 0,
        })
    }

    #[test]
    fn additive_increase_is_capped() {
        let g = governor(1000);
        assert_eq!(g.next_batch_size(&[BatchOutcome::Success]), 20);
        assert_eq!(g.next_batch_size(&[BatchOutcome::Success; 10]), 32);
    }

    #[test]
    fn multiplicative_decrease_has_a_floor() {
        let g = governor(1000);
        assert_eq!(g.next_batch_size(&[BatchOutcome::OutOfMemory]), 8);
        assert_eq!(g.next_batch_size(&[BatchOutcome::OverBudget; 10]), 1);
    }

    #[test]
    fn record_updates_live_size() {
        let g = governor(1000);
        assert_eq!(g.record(BatchOutcome::OverBudget), 8);
        assert_eq!(g.record(BatchOutcome::Success), 12);
        assert_eq!(g.recommended_batch_size(), 12);
    }

    #[test]
    fn estimate_adds_overhead() {
        let g = ResourceGovernor::new(GovernorConfig {
            item_overhead_bytes: 100,
            ..GovernorConfig::default()
        });
        assert_eq!(g.estimate_memory(&["abc", "de"]), 205);
    }

    #[test]
    fn try_admit_enforces_budget_and_releases_on_drop() {
        let g = governor(100);
        let a = g.try_admit(60).unwrap();
        let err = g.try_admit(50).unwrap_err();
        assert!(matches!(
            err,
            Error::ResourceExhausted {
                requested: 50,
                available: 40
            }
        ));

        drop(a);
        assert_eq!(g.budget().current_estimate_bytes, 0);
        assert!(g.try_admit(100).is_ok());
    }

    #[tokio::test]
    async fn admit_refuses_what_can_never_fit() {
        let g = governor(100);
        assert!(g.admit(101).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn admit_waits_for_release() {
        let g = Arc::new(governor(100));
        let held = g.try_admit(80).unwrap();

        let waiter = {
            let g = Arc::clone(&g);
            tokio::spawn(async move {
                let permit = g.admit(50).await.unwrap();
                permit.bytes()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap(), 50);
    }

    #[tokio::test]
    async fn run_batched_processes_everything_in_order() {
        let g = governor(10_000);
        let items: Vec<String> = (0..50).map(|i| format!("item-{i}")).collect();
        let seen = Mutex::new(Vec::new());

        let batches = g
            .run_batched(&items, |batch| {
                seen.lock().extend(batch.iter().cloned());
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock(), items);
        assert!(batches >= 2);
    }

    #[tokio::test]
    async fn run_batched_halves_on_out_of_memory() {
        let g = governor(10_000);
        let items: Vec<String> = (0..16).map(|i| i.to_string()).collect();
        let sizes = Mutex::new(Vec::new());

        g.run_batched(&items, |batch| {
            sizes.lock().push(batch.len());
            let len = batch.len();
            async move {
                if len > 4 {
                    Err(Error::ResourceExhausted {
                        requested: len as u64,
                        available: 4,
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

        let sizes = sizes.lock();
        assert_eq!(&sizes[..3], &[16, 8, 4]);
        assert!(sizes.iter().skip(3).all(|&s| s <= 4 || s == 8));
    }

    #[tokio::test]
    async fn run_batched_shrinks_to_fit_budget() {
        // Each item costs 10 bytes; only 3 fit.
        let g = ResourceGovernor::new(GovernorConfig {
            max_memory_bytes: 30,
            initial_batch_size: 16,
            batch_increment: 1,
            min_batch_size: 1,
            max_batch_size: 16,
            item_overhead_bytes: 0,
        });
        let items: Vec<String> = (0..6).map(|_| "x".repeat(10)).collect();
        let max_seen = Mutex::new(0usize);

        g.run_batched(&items, |batch| {
            let mut max = max_seen.lock();
            *max = (*max).max(batch.len());
            async { Ok(()) }
        })
        .await
        .unwrap();

        assert!(*max_seen.lock() <= 3);
    }

    #[test]
    fn budget_snapshot() {
        let g = governor(100);
        let _permit = g.try_admit(30).unwrap();
        let budget = g.budget();
        assert_eq!(budget.max_memory_bytes, 100);
        assert_eq!(budget.current_estimate_bytes, 30);
        assert_eq!(budget.recommended_batch_size, 16);
        #[cfg(target_os = "linux")]
        assert!(budget.resident_bytes.is_some_and(|b| b > 0));
    }

    proptest! {
        #[test]
        fn over_budget_strictly_decreases_until_floor(
            initial in 2usize..512,
            rounds in 1usize..12,
        ) {
            let g = ResourceGovernor::new(GovernorConfig {
                initial_batch_size: initial,
                min_batch_size: 1,
                max_batch_size: 512,
                ..GovernorConfig::default()
            });
            let mut previous = g.recommended_batch_size();
            for _ in 0..rounds {
                let next = g.record(BatchOutcome::OverBudget);
                if previous > 1 {
                    prop_assert!(next < previous);
                } else {
                    prop_assert_eq!(next, 1);
                }
                previous = next;
            }
        }
    }
}
