//! Error types for bi-level routing attention

use thiserror::Error;

/// Top-level error for every fallible operation in the workspace
#[derive(Error, Debug)]
pub enum BraError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error("Shape error: {0}")]
    Shape(#[from] ShapeError),
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Shape and layout violations detected while running a forward pass
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("Expected a rank-{expected} tensor, got rank {actual}")]
    Rank { expected: usize, actual: usize },
    #[error("Channel mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },
    #[error("Spatial axis {axis} has zero extent")]
    EmptyAxis { axis: &'static str },
    #[error("Spatial axis {axis} of extent {extent} is not divisible by n_win={n_win}")]
    NotDivisible { axis: &'static str, extent: usize, n_win: usize },
    #[error("Window extent {extent} along {axis} is smaller than pooling ratio {ratio}")]
    WindowTooSmall { axis: &'static str, extent: usize, ratio: usize },
    #[error("Expected {expected} windows, got {actual}")]
    WindowCount { expected: usize, actual: usize },
    #[error("topk={topk} exceeds the number of windows ({windows})")]
    TopkExceedsWindows { topk: usize, windows: usize },
    #[error("Routing shape {routing:?} does not match key/value shape {kv:?}")]
    RoutingMismatch { routing: Vec<usize>, kv: Vec<usize> },
}

/// Result type used across the workspace
pub type Result<T> = std::result::Result<T, BraError>;

impl BraError {
    /// Shorthand for a configuration error with a formatted message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Shorthand for a not-implemented error with a formatted message.
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented(_))
    }

    pub fn is_shape(&self) -> bool {
        matches!(self, Self::Shape(_))
    }
}

impl From<serde_json::Error> for BraError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BraError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for BraError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
