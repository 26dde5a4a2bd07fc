use serde::{Deserialize, Serialize};

/// Plain-vanilla option side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    /// Call option payoff profile.
    Call,
    /// Put option payoff profile.
    Put,
}

impl OptionType {
    /// Returns +1.0 for calls and -1.0 for puts.
    pub fn sign(self) -> f64 {
        match self {
            Self::Call => 1.0,
            Self::Put => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Put => "put",
        }
    }
}

/// Instrument family a strategy trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Stock,
    Option,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stock => "stock",
            Self::Option => "option",
        }
    }
}

/// Outcome grade attached to a distribution fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Success,
    Warn,
    Fail,
}

impl FitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }
}

/// Residence of a generated path matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTag {
    /// Fully materialized in RAM.
    Memory,
    /// File-backed raw matrix, deleted at run closure.
    Memmap,
    /// File-backed raw matrix retained as a run artifact.
    Persistent,
}

impl StorageTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Memmap => "memmap",
            Self::Persistent => "persistent",
        }
    }
}

/// Completion state recorded on a run's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Complete,
    /// Run completed but a stage raised a non-fatal warning.
    Warn,
    /// Run aborted; partial artifacts only.
    Incomplete,
}

impl CompletionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Warn => "warn",
            Self::Incomplete => "incomplete",
        }
    }
}
