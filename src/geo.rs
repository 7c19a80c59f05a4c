//! Geolocation resolver.
//!
//! Maps remote addresses to display country names.  Results are memoised in a
//! persistent, size-bounded cache keyed by address; the cache is independent
//! of the database file, so refreshing the database never invalidates it.
//! Failed lookups return [`UNKNOWN_COUNTRY`] and are not cached.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use log::{debug, info, warn};
use maxminddb::{geoip2, Reader};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{Result, TrackerError};
use crate::store;
use crate::types::UNKNOWN_COUNTRY;

/// Source of raw country names for an address.
pub trait GeoLookup: Send + Sync {
    fn country(&self, ip: IpAddr) -> Option<String>;

    /// Re-opens the backing database after it has been replaced on disk.
    fn reload(&self) -> Result<()>;
}

/// Country lookups against a MaxMind-format database file.
pub struct MaxmindLookup {
    path: PathBuf,
    reader: RwLock<Option<Reader<Vec<u8>>>>,
}

impl MaxmindLookup {
    /// Opens the database if present.  A missing database is not an error;
    /// every lookup resolves to "Unknown" until a refresh installs one.
    pub fn open(path: &Path) -> Self {
        let lookup = Self {
            path: path.to_path_buf(),
            reader: RwLock::new(None),
        };
        if let Err(e) = lookup.reload() {
            warn!("Geolocation database unavailable at {}: {}", path.display(), e);
        }
        lookup
    }
}

impl GeoLookup for MaxmindLookup {
    fn country(&self, ip: IpAddr) -> Option<String> {
        let guard = self.reader.read().ok()?;
        let reader = guard.as_ref()?;
        let record: geoip2::Country = match reader.lookup(ip) {
            Ok(r) => r,
            Err(e) => {
                debug!("Geolocation lookup failed for {}: {}", ip, e);
                return None;
            }
        };
        let country = record.country?;
        country
            .names
            .as_ref()
            .and_then(|names| names.get("en"))
            .map(|name| name.to_string())
            .or_else(|| country.iso_code.map(str::to_string))
    }

    fn reload(&self) -> Result<()> {
        let reader = Reader::open_readfile(&self.path)
            .map_err(|e| TrackerError::Geo(format!("{}: {}", self.path.display(), e)))?;
        let mut guard = self
            .reader
            .write()
            .map_err(|_| TrackerError::Geo("database lock poisoned".into()))?;
        *guard = Some(reader);
        info!("Loaded geolocation database {}", self.path.display());
        Ok(())
    }
}

/// Country-name spellings collapsed onto one display label.
const CANONICAL_NAMES: &[(&str, &str)] = &[
    ("Iran, Islamic Republic of", "Iran"),
    ("Islamic Republic of Iran", "Iran"),
    ("Russian Federation", "Russia"),
    ("Korea, Republic of", "South Korea"),
    ("Republic of Korea", "South Korea"),
    ("Korea, Democratic People's Republic of", "North Korea"),
    ("Viet Nam", "Vietnam"),
    ("Syrian Arab Republic", "Syria"),
    ("Taiwan, Province of China", "Taiwan"),
    ("Moldova, Republic of", "Moldova"),
    ("Republic of Moldova", "Moldova"),
    ("Tanzania, United Republic of", "Tanzania"),
    ("Venezuela, Bolivarian Republic of", "Venezuela"),
    ("Bolivia, Plurinational State of", "Bolivia"),
    ("Lao People's Democratic Republic", "Laos"),
    ("Czechia", "Czech Republic"),
    ("United States of America", "United States"),
    ("United Kingdom of Great Britain and Northern Ireland", "United Kingdom"),
    ("Türkiye", "Turkey"),
];

/// Strips a leading `"XX, "` country-code prefix and folds known spelling
/// variants.  Empty or placeholder answers become `None`.
pub fn normalize(raw: &str) -> Option<String> {
    let mut name = raw.trim();
    if let Some((code, rest)) = name.split_once(", ") {
        if code.len() == 2 && code.chars().all(|c| c.is_ascii_uppercase()) {
            name = rest.trim();
        }
    }
    if name.is_empty()
        || name.eq_ignore_ascii_case(UNKNOWN_COUNTRY)
        || name.contains("not found")
        || name == "--"
    {
        return None;
    }
    let canonical = CANONICAL_NAMES
        .iter()
        .find(|(variant, _)| *variant == name)
        .map(|(_, label)| *label)
        .unwrap_or(name);
    Some(canonical.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CacheEntry {
    ip: String,
    country: String,
}

/// Address to country memo, ordered by insertion.
///
/// When the entry count exceeds the limit, the oldest entries are dropped so
/// only the most recently appended `limit` remain.
#[derive(Debug)]
pub struct GeoCache {
    limit: usize,
    order: VecDeque<String>,
    map: HashMap<String, String>,
    dirty: bool,
}

impl GeoCache {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            order: VecDeque::new(),
            map: HashMap::new(),
            dirty: false,
        }
    }

    pub fn load(path: &Path, limit: usize) -> Result<Self> {
        let entries: Vec<CacheEntry> = store::load_or_default(path)?;
        let mut cache = Self::new(limit);
        for entry in entries {
            cache.insert(entry.ip, entry.country);
        }
        cache.dirty = false;
        Ok(cache)
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        let entries: Vec<CacheEntry> = self
            .order
            .iter()
            .filter_map(|ip| {
                self.map.get(ip).map(|country| CacheEntry {
                    ip: ip.clone(),
                    country: country.clone(),
                })
            })
            .collect();
        store::save(path, &entries)?;
        self.dirty = false;
        Ok(())
    }

    pub fn get(&self, ip: &str) -> Option<&str> {
        self.map.get(ip).map(String::as_str)
    }

    /// Inserts a mapping.  Existing entries are immutable and are left as
    /// they are.
    pub fn insert(&mut self, ip: String, country: String) {
        if self.map.contains_key(&ip) {
            return;
        }
        self.order.push_back(ip.clone());
        self.map.insert(ip, country);
        self.dirty = true;
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

pub struct Resolver {
    lookup: Box<dyn GeoLookup>,
    cache: GeoCache,
    cache_path: PathBuf,
}

impl Resolver {
    pub fn new(lookup: Box<dyn GeoLookup>, cache: GeoCache, cache_path: PathBuf) -> Self {
        Self {
            lookup,
            cache,
            cache_path,
        }
    }

    pub fn resolve(&mut self, ip: IpAddr) -> String {
        let key = ip.to_string();
        if let Some(country) = self.cache.get(&key) {
            return country.to_string();
        }
        match self.lookup.country(ip).as_deref().and_then(normalize) {
            Some(country) => {
                self.cache.insert(key, country.clone());
                country
            }
            None => UNKNOWN_COUNTRY.to_string(),
        }
    }

    /// Writes the cache back to disk if anything was added since the last
    /// save.
    pub fn persist(&mut self) -> Result<()> {
        if self.cache.is_dirty() {
            self.cache.save(&self.cache_path)?;
        }
        Ok(())
    }

    pub fn reload_database(&self) -> Result<()> {
        self.lookup.reload()
    }

    #[cfg(test)]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

/// Downloads a fresh database to `dest`.
///
/// The body is streamed into a temporary sibling and aborted once it exceeds
/// `max_bytes`.  The file only replaces `dest` if it is at least `min_bytes`
/// long.
pub async fn refresh_database(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    min_bytes: u64,
    max_bytes: u64,
) -> Result<u64> {
    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| TrackerError::Download(e.to_string()))?;

    if let Some(len) = response.content_length() {
        if len > max_bytes {
            return Err(TrackerError::Download(format!(
                "advertised size {} exceeds limit {}",
                len, max_bytes
            )));
        }
    }

    let tmp = store::with_suffix(dest, ".download");
    let written = match download_to(&mut response, &tmp, min_bytes, max_bytes).await {
        Ok(written) => written,
        Err(e) => {
            if let Err(rm) = store::remove(&tmp) {
                warn!("Cannot remove partial download {}: {}", tmp.display(), rm);
            }
            return Err(e);
        }
    };
    tokio::fs::rename(&tmp, dest).await?;
    info!("Installed geolocation database ({} bytes) at {}", written, dest.display());
    Ok(written)
}

/// Streams the body into `tmp`.  Any error leaves the partial file behind
/// for the caller to remove.
async fn download_to(
    response: &mut reqwest::Response,
    tmp: &Path,
    min_bytes: u64,
    max_bytes: u64,
) -> Result<u64> {
    let mut file = tokio::fs::File::create(tmp).await?;
    let mut written: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| TrackerError::Download(e.to_string()))?
    {
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(TrackerError::Download(format!(
                "body exceeds limit {}",
                max_bytes
            )));
        }
        file.write_all(&chunk).await?;
    }
    file.sync_all().await?;

    if written < min_bytes {
        return Err(TrackerError::Download(format!(
            "downloaded {} bytes, expected at least {}",
            written, min_bytes
        )));
    }
    Ok(written)
}
