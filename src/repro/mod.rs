//! Reproducibility envelope: fingerprints, seeds, environment capture,
//! metadata persistence, and drift detection.

pub mod artifacts;
pub mod drift;
pub mod environment;
pub mod fingerprint;
pub mod meta;
pub mod seeds;

pub use artifacts::{persist_json_with_hash, sha256_hex, short_content_id, write_atomic};
pub use drift::{classify_drift, DriftClass, DriftFinding, DriftReport};
pub use environment::{CodeVersion, EnvironmentInfo};
pub use fingerprint::{fingerprint_bars, DataFingerprint, ReturnsSummary};
pub use meta::{BankruptcySummary, RunMetadata, META_FILE, META_SCHEMA_VERSION};
pub use seeds::{config_seed, derive_seed, path_seed};
