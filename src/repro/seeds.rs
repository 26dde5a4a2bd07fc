//! Deterministic child-seed derivation.
//!
//! Every subordinate random stream (per grid config, per path, per memmap
//! chunk, per bootstrap draw) derives its seed from the parent seed and a
//! stable label through a fixed hash, never from process-local counters.
//! This keeps grid outputs invariant to worker count and chunk size.

use sha2::{Digest, Sha256};

/// Derives a child seed from `(parent, label)`.
///
/// The child is the first eight little-endian bytes of
/// `sha256(parent_le || label)`.
pub fn derive_seed(parent: u64, label: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(parent.to_le_bytes());
    hasher.update(label.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Seed for the stream that fills path row `row`.
pub fn path_seed(parent: u64, row: usize) -> u64 {
    derive_seed(parent, &format!("path/{row}"))
}

/// Seed for the worker evaluating grid config `config_id`.
pub fn config_seed(parent: u64, config_id: &str) -> u64 {
    derive_seed(parent, &format!("config/{config_id}"))
}
