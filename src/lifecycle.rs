//! State lifecycle manager.
//!
//! Detects restarts of the primary instance through its start marker and
//! resets the cumulative state when one happens: the live files are archived
//! under a timestamp, cleared, and then re-seeded from the routine `.bak`
//! copies if there are any.  Routine backups are taken on their own
//! schedule, independent of restarts.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{self, StatePaths};

/// Start marker of the instance whose restarts reset the cumulative state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMarker {
    pub instance: String,
    pub marker: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// Marker matched, or could not be fetched.
    Unchanged,
    /// No marker was stored yet; it has been recorded.
    FirstRun,
    /// A different instance is now monitored; its marker was recorded
    /// without touching the state.
    Repinned,
    /// A restart was detected and the cumulative state reset.
    Reset { restored: bool },
}

pub struct StateManager {
    paths: StatePaths,
    archive_keep: usize,
    last: Option<StartMarker>,
}

impl StateManager {
    pub fn new(paths: StatePaths, archive_keep: usize) -> Result<Self> {
        let last = store::load(&paths.marker)?;
        Ok(Self {
            paths,
            archive_keep,
            last,
        })
    }

    /// Instance whose marker was last recorded, if any.
    pub fn pinned_instance(&self) -> Option<&str> {
        self.last.as_ref().map(|m| m.instance.as_str())
    }

    /// Compares `current` with the stored marker.  `None` means the marker
    /// could not be fetched; that never triggers a reset.
    pub fn check_restart(
        &mut self,
        current: Option<&StartMarker>,
        now: u64,
    ) -> Result<RestartOutcome> {
        let Some(current) = current else {
            warn!("Instance start marker unavailable; skipping restart check");
            return Ok(RestartOutcome::Unchanged);
        };

        match &self.last {
            Some(last) if last == current => return Ok(RestartOutcome::Unchanged),
            None => {
                self.store_marker(current)?;
                info!("Recorded initial start marker of {}", current.instance);
                return Ok(RestartOutcome::FirstRun);
            }
            Some(last) if last.instance != current.instance => {
                info!(
                    "Monitored instance changed from {} to {}; keeping state",
                    last.instance, current.instance
                );
                self.store_marker(current)?;
                return Ok(RestartOutcome::Repinned);
            }
            Some(_) => {}
        }

        info!(
            "Restart of {} detected; resetting cumulative state",
            current.instance
        );
        for path in [&self.paths.totals, &self.paths.ips, &self.paths.geo_cache] {
            if has_records(path) {
                self.archive(path, now)?;
            }
        }

        store::remove(&self.paths.totals)?;
        store::remove(&self.paths.ips)?;

        let mut restored = false;
        for path in [&self.paths.totals, &self.paths.ips] {
            let backup = StatePaths::backup_of(path);
            if backup.exists() {
                store::copy_atomic(&backup, path)?;
                info!("Restored {} from {}", path.display(), backup.display());
                restored = true;
            }
        }

        self.store_marker(current)?;
        Ok(RestartOutcome::Reset { restored })
    }

    /// Copies every non-empty state file to its `.bak` sibling.
    pub fn routine_backup(&self) -> Result<usize> {
        let mut copied = 0;
        for path in [&self.paths.totals, &self.paths.ips, &self.paths.geo_cache] {
            if has_records(path) {
                store::copy_atomic(path, &StatePaths::backup_of(path))?;
                copied += 1;
            }
        }
        info!("Routine backup wrote {} state files", copied);
        Ok(copied)
    }

    fn store_marker(&mut self, marker: &StartMarker) -> Result<()> {
        store::save(&self.paths.marker, marker)?;
        self.last = Some(marker.clone());
        Ok(())
    }

    fn archive(&self, path: &Path, now: u64) -> Result<()> {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(());
        };
        fs::create_dir_all(&self.paths.archive)?;
        let dest = self.paths.archive.join(format!("{}.{}", name, now));
        store::copy_atomic(path, &dest)?;
        debug!("Archived {} to {}", path.display(), dest.display());
        self.prune_archives(name)
    }

    /// Keeps only the newest `archive_keep` archives of one file.
    fn prune_archives(&self, name: &str) -> Result<()> {
        let prefix = format!("{}.", name);
        let mut archives: Vec<(u64, PathBuf)> = fs::read_dir(&self.paths.archive)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file_name = entry.file_name().into_string().ok()?;
                let stamp = file_name.strip_prefix(&prefix)?.parse::<u64>().ok()?;
                Some((stamp, entry.path()))
            })
            .collect();
        archives.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, stale) in archives.into_iter().skip(self.archive_keep) {
            store::remove(&stale)?;
        }
        Ok(())
    }
}

/// True if the file holds a document with at least one record.  Unreadable
/// files are treated as empty.
fn has_records(path: &Path) -> bool {
    match store::load::<serde_json::Value>(path) {
        Ok(Some(serde_json::Value::Array(items))) => !items.is_empty(),
        Ok(Some(serde_json::Value::Object(map))) => !map.is_empty(),
        Ok(_) => false,
        Err(e) => {
            warn!("Cannot inspect {}: {}", path.display(), e);
            false
        }
    }
}
