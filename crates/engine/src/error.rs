//! Error type shared by the backtest engine, strategies and optimizer

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid backtest configuration: {0}")]
    InvalidConfig(String),

    #[error("No market data to replay")]
    EmptyData,

    #[error("Market data not sorted ascending by timestamp at bar {index}")]
    UnsortedData { index: usize },

    #[error("Invalid bar at index {index}: {reason}")]
    InvalidBar { index: usize, reason: String },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid range for parameter '{name}': {reason}")]
    InvalidRange { name: String, reason: String },

    #[error("Parameter grid has {count} combinations (limit {limit})")]
    TooManyCombinations { count: u64, limit: u64 },

    #[error("Unknown optimization metric: {0}")]
    UnknownMetric(String),

    #[error("Strategy error: {0}")]
    Strategy(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Result store error: {0}")]
    Store(String),

    #[error("Market data error: {0}")]
    Data(String),
}

impl EngineError {
    /// Whether the error was caused by caller input rather than the runtime
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidConfig(_)
                | EngineError::EmptyData
                | EngineError::UnsortedData { .. }
                | EngineError::InvalidBar { .. }
                | EngineError::InvalidParameter(_)
                | EngineError::InvalidRange { .. }
                | EngineError::TooManyCombinations { .. }
                | EngineError::UnknownMetric(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
