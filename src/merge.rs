//! Aggregator and merger.
//!
//! Folds one window of [`SampleDelta`]s into the cumulative per-country
//! totals and the unique address ledger, and replaces the snapshot of the
//! latest window.  Scaled increments are staged in memory first; they are
//! only dropped once the on-disk read-add-write pass succeeds, so a failed
//! write is retried with the next window.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geo::Resolver;
use crate::store::{self, StatePaths};
use crate::types::{Direction, DutyCycle, SampleDelta, SnapshotRecord, Traffic};

pub type CountryTotals = BTreeMap<String, Traffic>;

/// Every remote address ever seen, with the country it resolved to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IpRecord {
    pub country: String,
    pub ip: String,
}

pub type IpLedger = BTreeSet<IpRecord>;

pub fn load_totals(path: &Path) -> Result<CountryTotals> {
    store::load_or_default(path)
}

pub fn load_ledger(path: &Path) -> Result<IpLedger> {
    store::load_or_default(path)
}

#[cfg(test)]
pub fn load_snapshot(path: &Path) -> Result<Vec<SnapshotRecord>> {
    store::load_or_default(path)
}

/// Outcome of one merged window, for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowSummary {
    pub records: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub countries: usize,
}

pub struct Merger {
    totals_path: PathBuf,
    ips_path: PathBuf,
    snapshot_path: PathBuf,
    pending_totals: CountryTotals,
    pending_ips: IpLedger,
}

impl Merger {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            totals_path: paths.totals.clone(),
            ips_path: paths.ips.clone(),
            snapshot_path: paths.snapshot.clone(),
            pending_totals: CountryTotals::new(),
            pending_ips: IpLedger::new(),
        }
    }

    /// Merges one window.  Country lookups go through `resolver`, byte
    /// counts are scaled by the duty cycle before they reach the totals,
    /// and the snapshot keeps the raw counts.
    pub fn merge(
        &mut self,
        deltas: &[SampleDelta],
        duty: DutyCycle,
        resolver: &mut Resolver,
    ) -> Result<WindowSummary> {
        let mut snapshot = Vec::with_capacity(deltas.len());
        let mut summary = WindowSummary {
            records: deltas.len(),
            ..WindowSummary::default()
        };
        let mut countries = BTreeSet::new();

        for delta in deltas {
            let country = resolver.resolve(delta.remote);
            let scaled = duty.scale(delta.bytes);
            match delta.direction {
                Direction::In => summary.bytes_in = summary.bytes_in.saturating_add(scaled),
                Direction::Out => summary.bytes_out = summary.bytes_out.saturating_add(scaled),
            }

            self.pending_totals
                .entry(country.clone())
                .or_default()
                .add(delta.direction, scaled);
            self.pending_ips.insert(IpRecord {
                country: country.clone(),
                ip: delta.remote.to_string(),
            });
            snapshot.push(SnapshotRecord {
                direction: delta.direction,
                country: country.clone(),
                bytes: delta.bytes,
                ip: delta.remote.to_string(),
            });
            countries.insert(country);
        }
        summary.countries = countries.len();

        let flushed = self.flush();
        let replaced = store::save(&self.snapshot_path, &snapshot);
        if let Err(e) = &replaced {
            warn!("Failed to replace window snapshot: {}", e);
        }
        flushed?;
        replaced?;

        info!(
            "Merged window: {} records, {} B in, {} B out across {} countries (x{:.2})",
            summary.records,
            summary.bytes_in,
            summary.bytes_out,
            summary.countries,
            duty.multiplier()
        );
        Ok(summary)
    }

    /// Adds staged increments to the persisted totals and ledger.  On
    /// failure the increments stay staged for the next attempt.
    pub fn flush(&mut self) -> Result<()> {
        if !self.pending_totals.is_empty() {
            let mut totals = load_totals(&self.totals_path)?;
            for (country, traffic) in &self.pending_totals {
                totals.entry(country.clone()).or_default().absorb(*traffic);
            }
            store::save(&self.totals_path, &totals)?;
            self.pending_totals.clear();
        }

        if !self.pending_ips.is_empty() {
            let mut ledger = load_ledger(&self.ips_path)?;
            ledger.extend(self.pending_ips.iter().cloned());
            store::save(&self.ips_path, &ledger)?;
            self.pending_ips.clear();
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_totals.is_empty() || !self.pending_ips.is_empty()
    }

    /// Drops staged increments that belong to a run that has just been
    /// reset.
    pub fn discard_pending(&mut self) {
        if self.has_pending() {
            warn!("Discarding unflushed increments after state reset");
        }
        self.pending_totals.clear();
        self.pending_ips.clear();
    }
}
