use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide ledger of calls attempted against the upstream in the
/// current batch window. This is the only state shared across requests;
/// `try_admit` is a single lock-free check-and-increment and admissions
/// are never undone within a batch, even when the admitted call fails.
pub struct QuotaLedger {
    max_per_batch: u32,
    batch_window: Duration,
    batch_calls: AtomicU32,
    total_calls: AtomicU64,
    batch_started: Mutex<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub batch_calls: u32,
    pub max_per_batch: u32,
    pub total_calls: u64,
}

impl QuotaUsage {
    pub fn remaining(&self) -> u32 {
        self.max_per_batch.saturating_sub(self.batch_calls)
    }
}

impl QuotaLedger {
    pub fn new(max_per_batch: u32, batch_window: Duration) -> Self {
        Self {
            max_per_batch,
            batch_window,
            batch_calls: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            batch_started: Mutex::new(Instant::now()),
        }
    }

    /// Atomically admits one upstream call if the batch has room.
    /// `Ok` carries the usage after the increment, `Err` the usage at the
    /// moment of rejection.
    pub fn try_admit(&self) -> Result<QuotaUsage, QuotaUsage> {
        let max = self.max_per_batch;
        match self
            .batch_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |calls| {
                (calls < max).then_some(calls + 1)
            }) {
            Ok(previous) => {
                let total = self.total_calls.fetch_add(1, Ordering::Relaxed) + 1;
                Ok(QuotaUsage {
                    batch_calls: previous + 1,
                    max_per_batch: max,
                    total_calls: total,
                })
            }
            Err(calls) => Err(QuotaUsage {
                batch_calls: calls,
                max_per_batch: max,
                total_calls: self.total_calls.load(Ordering::Relaxed),
            }),
        }
    }

    pub fn usage(&self) -> QuotaUsage {
        QuotaUsage {
            batch_calls: self.batch_calls.load(Ordering::Relaxed),
            max_per_batch: self.max_per_batch,
            total_calls: self.total_calls.load(Ordering::Relaxed),
        }
    }

    /// Whether the configured batch window has elapsed. The reset itself
    /// is always an explicit `reset_batch` call; `try_admit` never resets.
    pub fn batch_expired(&self) -> bool {
        let started = self.batch_started.lock().unwrap_or_else(|e| e.into_inner());
        started.elapsed() >= self.batch_window
    }

    /// Starts a new batch window. Returns the number of calls the previous
    /// batch admitted.
    pub fn reset_batch(&self) -> u32 {
        let mut started = self.batch_started.lock().unwrap_or_else(|e| e.into_inner());
        *started = Instant::now();
        self.batch_calls.swap(0, Ordering::SeqCst)
    }
}
