//! CLI error type.

use thiserror::Error;
use tilefetch::FetchError;

/// Errors surfaced to the user by the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid or missing arguments and configuration.
    #[error("{0}")]
    Config(String),

    /// A library operation failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Writing command output failed.
    #[error("could not write output: {0}")]
    Output(#[from] std::io::Error),
}
