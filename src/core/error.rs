//! Error types for the virtual geometry pipeline

use thiserror::Error;

/// Main error type for build and streaming operations
#[derive(Debug, Error)]
pub enum Error {
    /// The caller asked for fewer vertices/triangles than the input allows,
    /// or an input mesh is degenerate
    #[error("infeasible constraint: {0}")]
    InfeasibleConstraint(String),

    /// Graph partitioning failed; the calling build step cannot proceed
    #[error("partition error: {0}")]
    Partition(String),

    /// Offline build failure
    #[error("build error: {0}")]
    Build(String),

    /// Runtime streaming failure
    #[error("streaming error: {0}")]
    Streaming(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
