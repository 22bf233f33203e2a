use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the bridge counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    /// Local records written into the replica.
    pub records_mirrored_out: u64,
    /// Replica changes applied to the local store.
    pub records_mirrored_in: u64,
    /// Local-only kinds that never left this client.
    pub records_filtered: u64,
    /// Local records that could not be canonicalized.
    pub records_skipped: u64,
    /// Incoming records with a local-only kind or an id that disagrees with
    /// their key.
    pub records_rejected: u64,
    /// Incoming values that did not decode.
    pub records_malformed: u64,
    pub echoes_suppressed: u64,
    pub bootstrap_runs: u64,
    pub bootstrap_adopted: u64,
}

/// Lock-free counters updated from the bridge callbacks.
#[derive(Debug, Default)]
pub struct SyncStats {
    records_mirrored_out: AtomicU64,
    records_mirrored_in: AtomicU64,
    records_filtered: AtomicU64,
    records_skipped: AtomicU64,
    records_rejected: AtomicU64,
    records_malformed: AtomicU64,
    echoes_suppressed: AtomicU64,
    bootstrap_runs: AtomicU64,
    bootstrap_adopted: AtomicU64,
}

fn bump(counter: &AtomicU64, by: usize) {
    if by > 0 {
        counter.fetch_add(by as u64, Ordering::Relaxed);
    }
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn mirrored_out(&self, n: usize) {
        bump(&self.records_mirrored_out, n);
    }

    pub(crate) fn mirrored_in(&self, n: usize) {
        bump(&self.records_mirrored_in, n);
    }

    pub(crate) fn filtered(&self, n: usize) {
        bump(&self.records_filtered, n);
    }

    pub(crate) fn skipped(&self, n: usize) {
        bump(&self.records_skipped, n);
    }

    pub(crate) fn rejected(&self, n: usize) {
        bump(&self.records_rejected, n);
    }

    pub(crate) fn malformed(&self, n: usize) {
        bump(&self.records_malformed, n);
    }

    pub(crate) fn echo_suppressed(&self) {
        bump(&self.echoes_suppressed, 1);
    }

    pub(crate) fn bootstrap_run(&self, adopted: usize) {
        bump(&self.bootstrap_runs, 1);
        bump(&self.bootstrap_adopted, adopted);
    }

    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            records_mirrored_out: self.records_mirrored_out.load(Ordering::Relaxed),
            records_mirrored_in: self.records_mirrored_in.load(Ordering::Relaxed),
            records_filtered: self.records_filtered.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            records_malformed: self.records_malformed.load(Ordering::Relaxed),
            echoes_suppressed: self.echoes_suppressed.load(Ordering::Relaxed),
            bootstrap_runs: self.bootstrap_runs.load(Ordering::Relaxed),
            bootstrap_adopted: self.bootstrap_adopted.load(Ordering::Relaxed),
        }
    }
}
