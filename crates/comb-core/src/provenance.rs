//! Provenance and schema descriptors shared across audit artifacts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version of a serialized audit artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Breaking layout changes.
    pub major: u32,
    /// Added fields.
    pub minor: u32,
    /// Wording and rendering fixes.
    pub patch: u32,
}

impl SchemaVersion {
    /// Builds a version triple.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::new(1, 0, 0)
    }
}

/// What an audit artifact was computed from.
///
/// Two artifacts with equal provenance (apart from `created_at`) were produced
/// from identical bytes, configuration and seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunProvenance {
    /// Canonical hash of the run configuration.
    pub config_hash: String,
    /// Lock hash of the pre-registration in force.
    pub preregistration_hash: String,
    /// SHA-256 of each input file, keyed by role (`observed`, `model`, `covariance`).
    pub input_hashes: BTreeMap<String, String>,
    /// Master seed every substream derives from.
    pub seed: u64,
    /// RFC-3339 creation time.
    pub created_at: String,
    /// Crate name to version.
    pub tool_versions: BTreeMap<String, String>,
}
