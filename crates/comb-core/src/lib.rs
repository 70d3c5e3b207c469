#![deny(missing_docs)]
#![doc = "Core error taxonomy, deterministic seeding and provenance descriptors for the comb audit engine."]

pub mod errors;
/// Stable hashing helpers.
pub mod hash;
pub mod provenance;
pub mod rng;
/// Canonical JSON serde helpers.
pub mod serde;

pub use errors::{AuditError, ErrorInfo};
pub use hash::{sha256_hex, stable_hash_string};
pub use provenance::{RunProvenance, SchemaVersion};
pub use rng::{derive_substream_seed, draw_seed, RngHandle};
pub use self::serde::{from_json_slice, to_canonical_json_bytes, to_canonical_json_pretty};
