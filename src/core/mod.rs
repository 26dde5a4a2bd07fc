//! Core domain types, the error taxonomy, and engine-wide tuning constants.

pub mod error;
pub mod tuning;
pub mod types;

pub use error::{EngineError, FitFailure, NumericFailure};
pub use types::{CompletionStatus, FitStatus, OptionType, StorageTag, StrategyKind};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;
