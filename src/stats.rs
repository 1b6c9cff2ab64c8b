use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Run-wide counters shared by every worker
#[derive(Default)]
pub struct RunStatistics {
    pub documents_scanned: AtomicU64,
    pub documents_with_links: AtomicU64,
    pub documents_done: AtomicU64,
    pub documents_errored: AtomicU64,
    pub references_found: AtomicU64,
    pub references_matched: AtomicU64,
    pub references_unmatched: AtomicU64,
    pub references_ambiguous: AtomicU64,
    pub references_updated: AtomicU64,
    pub blocks_updated: AtomicU64,
    pub blocks_planned: AtomicU64,
}

/// Point-in-time copy of [`RunStatistics`], for printing and the JSON summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub documents_scanned: u64,
    pub documents_with_links: u64,
    pub documents_done: u64,
    pub documents_errored: u64,
    pub references_found: u64,
    pub references_matched: u64,
    pub references_unmatched: u64,
    pub references_ambiguous: u64,
    pub references_updated: u64,
    pub blocks_updated: u64,
    pub blocks_planned: u64,
}

impl RunStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_scanned(&self) {
        self.documents_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_with_links(&self) {
        self.documents_with_links.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_done(&self) {
        self.documents_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errored(&self) {
        self.documents_errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_found(&self, count: u64) {
        self.references_found.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_matched(&self, count: u64) {
        self.references_matched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_unmatched(&self, count: u64) {
        self.references_unmatched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_ambiguous(&self, count: u64) {
        self.references_ambiguous.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_updated(&self, count: u64) {
        self.references_updated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_blocks_updated(&self, count: u64) {
        self.blocks_updated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_blocks_planned(&self, count: u64) {
        self.blocks_planned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn scanned(&self) -> u64 {
        self.documents_scanned.load(Ordering::Relaxed)
    }

    pub fn errored(&self) -> u64 {
        self.documents_errored.load(Ordering::Relaxed)
    }

    pub fn found(&self) -> u64 {
        self.references_found.load(Ordering::Relaxed)
    }

    pub fn matched(&self) -> u64 {
        self.references_matched.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            documents_scanned: load(&self.documents_scanned),
            documents_with_links: load(&self.documents_with_links),
            documents_done: load(&self.documents_done),
            documents_errored: load(&self.documents_errored),
            references_found: load(&self.references_found),
            references_matched: load(&self.references_matched),
            references_unmatched: load(&self.references_unmatched),
            references_ambiguous: load(&self.references_ambiguous),
            references_updated: load(&self.references_updated),
            blocks_updated: load(&self.blocks_updated),
            blocks_planned: load(&self.blocks_planned),
        }
    }
}

impl StatsSnapshot {
    /// Share of found references that matched, in percent
    pub fn match_rate(&self) -> f64 {
        if self.references_found == 0 {
            0.0
        } else {
            self.references_matched as f64 * 100.0 / self.references_found as f64
        }
    }
}
