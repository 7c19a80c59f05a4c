//! Data structures shared across the tracker.
//!
//! These types flow from the sampler through the merger into the
//! persisted state files.  They are serialised using
//! [`serde`](https://serde.rs/) so the on-disk records keep the same
//! field names as the types here.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Label used when a remote address cannot be geolocated.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// Direction of a flow relative to the local host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Remote address sent bytes to us.
    In,
    /// We sent bytes to the remote address.
    Out,
}

/// One remote address's byte count within one capture window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleDelta {
    pub direction: Direction,
    pub remote: IpAddr,
    pub bytes: u64,
}

/// Cumulative bandwidth for one country.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Traffic {
    pub fn add(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::In => self.bytes_in = self.bytes_in.saturating_add(bytes),
            Direction::Out => self.bytes_out = self.bytes_out.saturating_add(bytes),
        }
    }

    pub fn absorb(&mut self, other: Traffic) {
        self.bytes_in = self.bytes_in.saturating_add(other.bytes_in);
        self.bytes_out = self.bytes_out.saturating_add(other.bytes_out);
    }
}

/// One raw record of the most recently completed window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub direction: Direction,
    pub country: String,
    pub bytes: u64,
    pub ip: String,
}

/// Point-in-time peer counts, summed over every instance that answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: u64,
    pub connected: u64,
    pub connecting: u64,
}

/// Peer counts reported by one instance's status endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCount {
    pub connected: u64,
    pub connecting: u64,
}

/// Ratio of a full scheduler cycle to its capture phase.
///
/// A window sampled for `capture_secs` out of every
/// `capture_secs + idle_secs` is scaled up by that ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyCycle {
    capture_secs: u64,
    idle_secs: u64,
}

impl DutyCycle {
    /// Returns `None` when the capture phase is empty.
    pub fn new(capture_secs: u64, idle_secs: u64) -> Option<Self> {
        (capture_secs > 0).then_some(Self {
            capture_secs,
            idle_secs,
        })
    }

    /// Scales raw observed bytes to an estimate over the whole cycle.
    ///
    /// The result is exact when the ratio is whole.  Otherwise it is rounded
    /// to the nearest byte, half up.
    pub fn scale(&self, bytes: u64) -> u64 {
        let capture = u128::from(self.capture_secs);
        let cycle = capture + u128::from(self.idle_secs);
        let scaled = (u128::from(bytes) * cycle + capture / 2) / capture;
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }

    pub fn multiplier(&self) -> f64 {
        (self.capture_secs + self.idle_secs) as f64 / self.capture_secs as f64
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
