//! Connection history recorder.
//!
//! Appends a timestamped peer-count sample on its own interval and prunes
//! everything older than the retention horizon in the same pass.

use std::path::PathBuf;

use log::debug;

use crate::error::Result;
use crate::store;
use crate::types::HistoryEntry;

pub struct HistoryRecorder {
    path: PathBuf,
    retention_secs: u64,
    entries: Vec<HistoryEntry>,
}

impl HistoryRecorder {
    pub fn open(path: PathBuf, retention_secs: u64) -> Result<Self> {
        let mut entries: Vec<HistoryEntry> = store::load_or_default(&path)?;
        entries.sort_by_key(|e| e.timestamp);
        Ok(Self {
            path,
            retention_secs,
            entries,
        })
    }

    /// Appends a sample taken at `now`, prunes expired samples and persists
    /// the ledger.
    pub fn record(&mut self, connected: u64, connecting: u64, now: u64) -> Result<()> {
        self.entries.push(HistoryEntry {
            timestamp: now,
            connected,
            connecting,
        });
        self.prune(now);
        store::save(&self.path, &self.entries)?;
        debug!(
            "Recorded connection history: {} connected, {} connecting ({} samples kept)",
            connected,
            connecting,
            self.entries.len()
        );
        Ok(())
    }

    fn prune(&mut self, now: u64) {
        let horizon = now.saturating_sub(self.retention_secs);
        self.entries.retain(|e| e.timestamp >= horizon);
    }

    /// Returns the sample closest to `now - target_age_secs`, provided it
    /// lies within `tolerance_secs` of that instant.
    pub fn nearest(
        &self,
        target_age_secs: u64,
        tolerance_secs: u64,
        now: u64,
    ) -> Option<HistoryEntry> {
        let target = now.checked_sub(target_age_secs)?;
        self.entries
            .iter()
            .map(|e| (e.timestamp.abs_diff(target), e))
            .filter(|(distance, _)| *distance <= tolerance_secs)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, e)| *e)
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }
}
