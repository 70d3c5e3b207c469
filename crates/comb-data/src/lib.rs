#![deny(missing_docs)]
#![doc = "Input side of the comb audit: provenance gating, spectrum loading and covariance alignment."]

/// Covariance file parsing and alignment.
pub mod covariance;
/// Manifest hashing and validation.
pub mod manifest;
/// Spectrum parsing, units and alignment.
pub mod spectrum;

pub use covariance::{
    align_to_ell, convert_units, load_covariance, parse_covariance, submatrix, RawCovariance,
};
pub use manifest::{
    fingerprint, hash_file, load_manifest, validate, FileCheck, Manifest, ManifestEntry,
};
pub use spectrum::{
    align, load, load_channel, parse_channel, unit_factor, Channel, ChannelSeries, Spectrum,
    SpectrumSource, UnitConvention, DEFAULT_MIN_POINTS,
};
