//! Error Types Module
//!
//! Defines the error taxonomy surfaced by the pipeline engine: topology
//! mistakes made while wiring stages together, user-signalled aborts, and
//! timeouts. User errors are carried through unchanged via the `Other`
//! variant so a stage's own `anyhow::Error` becomes the pipeline's terminal
//! error without any translation at the boundary.

use thiserror::Error;

/// Errors produced by the pipeline engine.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A topology operation (`chain`, `fan_out`, `fan_in`, `connect_n_to_m`) was
    /// invoked with no current tail to connect from.
    #[error("cannot connect from an empty pipeline")]
    NoPredecessor,

    /// `fan_in`/`connect_n_to_m` asked for more upstream sources than exist.
    #[error("cannot merge {requested} sources: only {available} exist")]
    InsufficientSources { requested: usize, available: usize },

    /// A topology operation was attempted after the pipeline had already started.
    #[error("cannot modify pipeline topology after the first record has been submitted")]
    AlreadyStarted,

    /// `wait_with_timeout` elapsed before every tail stage signalled completion.
    #[error("timeout: pipeline could not drain within the allotted duration")]
    Timeout,

    /// A stage aborted the pipeline, or returned an error from its user function.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
