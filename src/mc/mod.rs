//! Monte Carlo price-path generation.
//!
//! Paths are built by exponentiating cumulative log-returns drawn from a
//! fitted [`ReturnDistribution`]. Each path row has its own derived random
//! stream, so the matrix is identical for any chunk size or storage tag.
//! Generation applies the overflow policy cell by cell: a value above the
//! cap or at/below zero marks the path bankrupt at its first crossing and
//! pins it to zero from that step on.

pub mod storage;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::core::tuning::{
    BANKRUPTCY_FAIL_RATE, BANKRUPTCY_WARN_RATE, PRICE_OVERFLOW_CAP, PRICE_UNDERFLOW_FRACTION,
};
use crate::core::{EngineError, NumericFailure, Result, StorageTag};
use crate::models::RowSampler;

pub use storage::{available_ram_per_worker, decide_storage, footprint_bytes, StorageDecision};

/// Requested shape and seed of a path matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathSettings {
    pub s0: f64,
    pub n_paths: usize,
    pub n_steps: usize,
    pub seed: u64,
}

/// Per-path record of the first step at which the overflow policy fired.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BankruptcyLedger {
    /// Map from path row to first-crossing step index (1-based step axis).
    pub first_crossing: BTreeMap<usize, usize>,
}

impl BankruptcyLedger {
    pub fn rate(&self, n_paths: usize) -> f64 {
        if n_paths == 0 {
            0.0
        } else {
            self.first_crossing.len() as f64 / n_paths as f64
        }
    }

    pub fn is_bankrupt(&self, row: usize) -> bool {
        self.first_crossing.contains_key(&row)
    }

    /// Histogram of first-crossing steps.
    pub fn step_histogram(&self) -> BTreeMap<usize, usize> {
        let mut hist = BTreeMap::new();
        for &step in self.first_crossing.values() {
            *hist.entry(step).or_insert(0usize) += 1;
        }
        hist
    }
}

/// Sidecar metadata persisted next to a file-backed matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsSidecar {
    pub settings: PathSettings,
    pub tag: StorageTag,
    pub content_hash: String,
    pub bankruptcies: BankruptcyLedger,
}

enum Backing {
    Memory(Vec<f64>),
    FileBacked { path: PathBuf },
}

/// A generated path matrix of shape `(n_paths, n_steps + 1)`.
pub struct PricePaths {
    settings: PathSettings,
    tag: StorageTag,
    backing: Backing,
    bankruptcies: BankruptcyLedger,
}

impl PricePaths {
    pub fn settings(&self) -> &PathSettings {
        &self.settings
    }

    pub fn n_paths(&self) -> usize {
        self.settings.n_paths
    }

    pub fn n_steps(&self) -> usize {
        self.settings.n_steps
    }

    pub fn storage_tag(&self) -> StorageTag {
        self.tag
    }

    pub fn bankruptcies(&self) -> &BankruptcyLedger {
        &self.bankruptcies
    }

    /// Row width including the s0 column.
    fn row_len(&self) -> usize {
        self.settings.n_steps + 1
    }

    /// Reads `rows` path rows starting at `row_start` into a dense buffer.
    pub fn chunk(&self, row_start: usize, rows: usize) -> Result<Vec<f64>> {
        let row_len = self.row_len();
        let end = row_start
            .checked_add(rows)
            .filter(|&e| e <= self.settings.n_paths)
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "chunk: rows [{row_start}, {row_start}+{rows}) exceed n_paths {}",
                    self.settings.n_paths
                ))
            })?;

        match &self.backing {
            Backing::Memory(values) => Ok(values[row_start * row_len..end * row_len].to_vec()),
            Backing::FileBacked { path } => {
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start((row_start * row_len * 8) as u64))?;
                let mut bytes = vec![0u8; rows * row_len * 8];
                file.read_exact(&mut bytes)?;
                Ok(bytes
                    .chunks_exact(8)
                    .map(|b| f64::from_le_bytes(b.try_into().expect("8-byte chunk")))
                    .collect())
            }
        }
    }

    /// Streams the matrix in chunks of at most `chunk_rows` rows.
    pub fn for_each_chunk<F>(&self, chunk_rows: usize, mut f: F) -> Result<()>
    where
        F: FnMut(usize, &[f64]) -> Result<()>,
    {
        let chunk_rows = chunk_rows.max(1);
        let mut row = 0;
        while row < self.settings.n_paths {
            let take = chunk_rows.min(self.settings.n_paths - row);
            let data = self.chunk(row, take)?;
            f(row, &data)?;
            row += take;
        }
        Ok(())
    }

    /// Materializes the full matrix. Intended for tests and small runs.
    pub fn to_vec(&self) -> Result<Vec<f64>> {
        self.chunk(0, self.settings.n_paths)
    }

    /// SHA-256 over the matrix bytes in row order.
    pub fn content_hash(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        self.for_each_chunk(4096, |_, data| {
            for v in data {
                hasher.update(v.to_le_bytes());
            }
            Ok(())
        })?;
        Ok(hex::encode(hasher.finalize()))
    }

    /// Applies the bankruptcy thresholds; `Ok(true)` means the run should be
    /// marked `warn`.
    pub fn enforce_bankruptcy_policy(&self) -> Result<bool> {
        let rate = self.bankruptcies.rate(self.settings.n_paths);
        if rate > BANKRUPTCY_FAIL_RATE {
            return Err(EngineError::Numeric(
                NumericFailure::Bankruptcy,
                format!(
                    "bankruptcy_rate: {rate:.3} exceeds {BANKRUPTCY_FAIL_RATE}; the fitted \
                     distribution drives most paths to zero, check drift and scale"
                ),
            ));
        }
        if rate > BANKRUPTCY_WARN_RATE {
            tracing::warn!(rate, "bankruptcy rate above warning threshold");
            return Ok(true);
        }
        Ok(false)
    }

    /// Path of the backing file, when file-backed.
    pub fn backing_file(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::FileBacked { path } => Some(path),
        }
    }

    /// Removes a non-persistent backing file at run closure.
    pub fn cleanup(self) -> Result<()> {
        if self.tag == StorageTag::Memmap {
            if let Backing::FileBacked { path } = &self.backing {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let sidecar = sidecar_path(path);
                if sidecar.exists() {
                    std::fs::remove_file(sidecar)?;
                }
            }
        }
        Ok(())
    }

    /// Reopens a persisted matrix from its sidecar, verifying the content hash.
    pub fn open(bin_path: &Path) -> Result<Self> {
        let sidecar: PathsSidecar =
            serde_json::from_str(&std::fs::read_to_string(sidecar_path(bin_path))?)?;
        let paths = Self {
            settings: sidecar.settings,
            tag: sidecar.tag,
            backing: Backing::FileBacked {
                path: bin_path.to_path_buf(),
            },
            bankruptcies: sidecar.bankruptcies,
        };
        let actual = paths.content_hash()?;
        if actual != sidecar.content_hash {
            return Err(EngineError::Data(format!(
                "paths file {}: content hash {actual} does not match recorded {}; \
                 the artifact was modified after the run",
                bin_path.display(),
                sidecar.content_hash
            )));
        }
        Ok(paths)
    }
}

fn sidecar_path(bin_path: &Path) -> PathBuf {
    bin_path.with_extension("json")
}

/// Generates a path matrix under the given storage decision.
///
/// `backing_dir` is required for the file-backed tags; the matrix lands in
/// `<backing_dir>/paths.bin` with a JSON sidecar.
pub fn generate(
    dist: &dyn RowSampler,
    settings: &PathSettings,
    decision: &StorageDecision,
    backing_dir: Option<&Path>,
) -> Result<PricePaths> {
    if settings.s0 <= 0.0 || !settings.s0.is_finite() {
        return Err(EngineError::Config(format!(
            "s0: {}; the initial price must be finite and > 0",
            settings.s0
        )));
    }

    let row_len = settings.n_steps + 1;
    let underflow_floor = settings.s0 * PRICE_UNDERFLOW_FRACTION;
    let mut ledger = BankruptcyLedger::default();

    let mut returns_buf = vec![0.0; settings.n_steps];
    let build_row = |row: usize,
                     returns_buf: &mut [f64],
                     out: &mut [f64],
                     ledger: &mut BankruptcyLedger|
     -> Result<()> {
        dist.fill_row(settings.seed, row, returns_buf);
        out[0] = settings.s0;
        let mut cum = 0.0;
        let mut bankrupt_at: Option<usize> = None;
        for (step, &r) in returns_buf.iter().enumerate() {
            if !r.is_finite() {
                return Err(EngineError::Numeric(
                    NumericFailure::Overflow,
                    format!("returns[{row}][{step}]: non-finite sample from the distribution"),
                ));
            }
            if bankrupt_at.is_some() {
                out[step + 1] = 0.0;
                continue;
            }
            cum += r;
            let value = settings.s0 * cum.exp();
            if value.is_nan() {
                return Err(EngineError::Numeric(
                    NumericFailure::Overflow,
                    format!("paths[{row}][{}]: NaN price", step + 1),
                ));
            }
            // +inf falls into the overflow branch via the cap comparison.
            if value > PRICE_OVERFLOW_CAP || value <= underflow_floor {
                bankrupt_at = Some(step + 1);
                out[step + 1] = 0.0;
            } else {
                out[step + 1] = value;
            }
        }
        if let Some(step) = bankrupt_at {
            ledger.first_crossing.insert(row, step);
        }
        Ok(())
    };

    let backing = match decision.tag {
        StorageTag::Memory => {
            let mut values = vec![0.0; settings.n_paths * row_len];
            for row in 0..settings.n_paths {
                let out = &mut values[row * row_len..(row + 1) * row_len];
                build_row(row, &mut returns_buf, out, &mut ledger)?;
            }
            Backing::Memory(values)
        }
        StorageTag::Memmap | StorageTag::Persistent => {
            let dir = backing_dir.ok_or_else(|| {
                EngineError::Config(
                    "backing_dir: missing; file-backed storage needs a run directory".to_string(),
                )
            })?;
            std::fs::create_dir_all(dir)?;
            let bin_path = dir.join("paths.bin");
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&bin_path)?;

            let chunk_rows = decision.chunk_rows.max(1);
            let mut chunk = vec![0.0; chunk_rows * row_len];
            let mut row = 0;
            while row < settings.n_paths {
                let take = chunk_rows.min(settings.n_paths - row);
                for local in 0..take {
                    let out = &mut chunk[local * row_len..(local + 1) * row_len];
                    build_row(row + local, &mut returns_buf, out, &mut ledger)?;
                }
                let mut bytes = Vec::with_capacity(take * row_len * 8);
                for v in &chunk[..take * row_len] {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                file.write_all(&bytes)?;
                row += take;
            }
            file.sync_all()?;
            Backing::FileBacked { path: bin_path }
        }
    };

    let paths = PricePaths {
        settings: *settings,
        tag: decision.tag,
        backing,
        bankruptcies: ledger,
    };

    if let Backing::FileBacked { path } = &paths.backing {
        let sidecar = PathsSidecar {
            settings: paths.settings,
            tag: paths.tag,
            content_hash: paths.content_hash()?,
            bankruptcies: paths.bankruptcies.clone(),
        };
        let text = serde_json::to_string_pretty(&sidecar)?;
        std::fs::write(sidecar_path(path), text)?;
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{fit, FitOptions, ModelKind, ReturnDistribution};
    use tempfile::tempdir;

    fn laplace_dist(loc: f64, scale: f64) -> ReturnDistribution {
        ReturnDistribution::Laplace(
            crate::models::laplace::Laplace::from_params(loc, scale, 1).unwrap(),
        )
    }

    fn mem_decision(n_paths: usize) -> StorageDecision {
        StorageDecision {
            tag: StorageTag::Memory,
            chunk_rows: n_paths,
            footprint: 0,
            budget: 0,
        }
    }

    #[test]
    fn first_column_is_s0_and_values_positive() {
        let dist = laplace_dist(0.0, 0.02);
        let settings = PathSettings {
            s0: 100.0,
            n_paths: 64,
            n_steps: 32,
            seed: 42,
        };
        let paths = generate(&dist, &settings, &mem_decision(64), None).unwrap();
        let values = paths.to_vec().unwrap();
        for row in 0..64 {
            assert_eq!(values[row * 33], 100.0);
            assert!(values[row * 33..(row + 1) * 33].iter().all(|&v| v > 0.0));
        }
        assert!(!paths.enforce_bankruptcy_policy().unwrap());
    }

    #[test]
    fn storage_tags_agree_within_tolerance() {
        let dist = laplace_dist(0.0, 0.02);
        let settings = PathSettings {
            s0: 100.0,
            n_paths: 128,
            n_steps: 50,
            seed: 42,
        };
        let dir = tempdir().unwrap();

        let in_memory = generate(&dist, &settings, &mem_decision(128), None).unwrap();
        let spilled = generate(
            &dist,
            &settings,
            &StorageDecision {
                tag: StorageTag::Memmap,
                chunk_rows: 17,
                footprint: 0,
                budget: 0,
            },
            Some(dir.path()),
        )
        .unwrap();

        let a = in_memory.to_vec().unwrap();
        let b = spilled.to_vec().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() <= 1.0e-10);
        }
        spilled.cleanup().unwrap();
        assert!(!dir.path().join("paths.bin").exists());
    }

    #[test]
    fn heavy_negative_drift_triggers_bankruptcy_error() {
        let dist = laplace_dist(-0.5, 0.3);
        let settings = PathSettings {
            s0: 100.0,
            n_paths: 1000,
            n_steps: 100,
            seed: 42,
        };
        let paths = generate(&dist, &settings, &mem_decision(1000), None).unwrap();
        let err = paths.enforce_bankruptcy_policy().unwrap_err();
        assert_eq!(err.tag(), "NumericError:Bankruptcy");
        assert!(paths.bankruptcies().rate(1000) > 0.5);
        assert!(!paths.bankruptcies().step_histogram().is_empty());
    }

    #[test]
    fn persisted_matrix_reopens_bitwise() {
        let dist = laplace_dist(0.0, 0.02);
        let settings = PathSettings {
            s0: 50.0,
            n_paths: 32,
            n_steps: 16,
            seed: 7,
        };
        let dir = tempdir().unwrap();
        let decision = StorageDecision {
            tag: StorageTag::Persistent,
            chunk_rows: 8,
            footprint: 0,
            budget: 0,
        };
        let paths = generate(&dist, &settings, &decision, Some(dir.path())).unwrap();
        let original = paths.to_vec().unwrap();
        let hash = paths.content_hash().unwrap();

        let reopened = PricePaths::open(&dir.path().join("paths.bin")).unwrap();
        assert_eq!(reopened.to_vec().unwrap(), original);
        assert_eq!(reopened.content_hash().unwrap(), hash);
    }

    #[test]
    fn distinct_seeds_produce_distinct_matrices() {
        let returns: Vec<f64> = {
            let d = laplace_dist(0.0, 0.02);
            let mut buf = vec![0.0; 1000];
            d.fill_row(1, 0, &mut buf);
            buf
        };
        let dist = fit(ModelKind::Laplace, &returns, 1, &FitOptions::default()).unwrap();
        let mk = |seed| {
            let settings = PathSettings {
                s0: 100.0,
                n_paths: 16,
                n_steps: 16,
                seed,
            };
            generate(&dist, &settings, &mem_decision(16), None)
                .unwrap()
                .content_hash()
                .unwrap()
        };
        assert_ne!(mk(1), mk(2));
    }
}
