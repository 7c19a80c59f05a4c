//! Versioned, crash-safe persistence for the tracker's state files.
//!
//! Every file is a JSON document of the form
//! `{"version": 1, "records": ...}`.  Writes go to a `.tmp` sibling which
//! is synced and then renamed over the target, so readers only ever see a
//! complete document.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
struct Envelope<'a, T> {
    version: u32,
    records: &'a T,
}

#[derive(Deserialize)]
struct OwnedEnvelope<T> {
    records: T,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Loads a versioned document, or `None` if the file does not exist.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value: serde_json::Value = serde_json::from_reader(BufReader::new(file))?;
    let probe: VersionProbe = serde_json::from_value(value.clone())?;
    if probe.version != SCHEMA_VERSION {
        return Err(TrackerError::SchemaVersion {
            path: path.to_path_buf(),
            found: probe.version,
            expected: SCHEMA_VERSION,
        });
    }
    let doc: OwnedEnvelope<T> = serde_json::from_value(value)?;
    Ok(Some(doc.records))
}

/// Loads a versioned document, falling back to the type's default.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    Ok(load(path)?.unwrap_or_default())
}

/// Atomically replaces `path` with the serialised `records`.
pub fn save<T: Serialize>(path: &Path, records: &T) -> Result<()> {
    let tmp = tmp_path(path);
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(
            &mut writer,
            &Envelope {
                version: SCHEMA_VERSION,
                records,
            },
        )?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!("Persisted {}", path.display());
    Ok(())
}

/// Atomically copies `src` over `dst`.
pub fn copy_atomic(src: &Path, dst: &Path) -> Result<()> {
    let tmp = tmp_path(dst);
    fs::copy(src, &tmp)?;
    File::open(&tmp)?.sync_all()?;
    fs::rename(&tmp, dst)?;
    Ok(())
}

/// Removes a file, treating "already gone" as success.
pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn tmp_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

/// Locations of every file the tracker owns under its data directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub totals: PathBuf,
    pub ips: PathBuf,
    pub snapshot: PathBuf,
    pub geo_cache: PathBuf,
    pub history: PathBuf,
    pub marker: PathBuf,
    pub archive: PathBuf,
}

impl StatePaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            totals: root.join("totals.json"),
            ips: root.join("ips.json"),
            snapshot: root.join("snapshot.json"),
            geo_cache: root.join("geocache.json"),
            history: root.join("history.json"),
            marker: root.join("marker"),
            archive: root.join("archive"),
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(&self.archive)?;
        Ok(())
    }

    pub fn backup_of(path: &Path) -> PathBuf {
        with_suffix(path, ".bak")
    }
}
