//! Atomic artifact persistence with content hashing.
//!
//! Every durable artifact is written to a sibling temporary file and
//! renamed into place on successful close, so a crash never leaves a
//! half-written file at the final path. JSON artifacts get a `.sha256`
//! sidecar in `sha256sum` format.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::{EngineError, Result};

/// SHA-256 of a byte slice as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// First twelve hex characters of the SHA-256 of a serializable value.
///
/// Used for content-addressed identifiers such as grid `config_id`s.
pub fn short_content_id<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_hex(&bytes)[..12].to_string())
}

/// Writes bytes atomically: temp sibling, sync, rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        EngineError::Io(format!(
            "rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })
}

/// Outcome of persisting a hashed JSON artifact.
#[derive(Debug, Clone)]
pub struct PersistedArtifact {
    pub path: PathBuf,
    pub sha_path: PathBuf,
    pub sha256: String,
    pub bytes_len: usize,
}

/// Serializes `value` to pretty JSON, writes it atomically, and writes a
/// `sha256sum`-format sidecar next to it.
pub fn persist_json_with_hash<T: Serialize>(path: &Path, value: &T) -> Result<PersistedArtifact> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let sha256 = sha256_hex(&bytes);
    write_atomic(path, &bytes)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact.json");
    let sha_path = path.with_extension("sha256");
    let sidecar = format!("{sha256}  {file_name}\n");
    write_atomic(&sha_path, sidecar.as_bytes())?;

    Ok(PersistedArtifact {
        path: path.to_path_buf(),
        sha_path,
        sha256,
        bytes_len: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        value: u64,
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn persisted_json_round_trips_with_valid_sidecar() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");
        let sample = Sample {
            name: "x".to_string(),
            value: 9,
        };

        let persisted = persist_json_with_hash(&path, &sample).unwrap();
        assert!(persisted.path.exists());
        assert!(persisted.sha_path.exists());
        assert_eq!(persisted.sha256.len(), 64);

        let text = fs::read_to_string(&path).unwrap();
        let parsed: Sample = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, sample);

        let sidecar = fs::read_to_string(&persisted.sha_path).unwrap();
        assert!(sidecar.starts_with(&persisted.sha256));
        assert!(sidecar.contains("sample.json"));
    }

    #[test]
    fn same_value_same_hash_across_directories() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let sample = Sample {
            name: "y".to_string(),
            value: 1,
        };
        let pa = persist_json_with_hash(&a.path().join("s.json"), &sample).unwrap();
        let pb = persist_json_with_hash(&b.path().join("s.json"), &sample).unwrap();
        assert_eq!(pa.sha256, pb.sha256);
    }

    #[test]
    fn short_ids_are_stable() {
        let sample = Sample {
            name: "z".to_string(),
            value: 2,
        };
        assert_eq!(
            short_content_id(&sample).unwrap(),
            short_content_id(&sample).unwrap()
        );
        assert_eq!(short_content_id(&sample).unwrap().len(), 12);
    }
}
