//! Runtime error definitions.

use thiserror::Error;

/// Errors that can occur while talking to the proxy runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// HTTP transport to the controller failed.
    #[error("controller request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Controller answered with a non-success status.
    #[error("controller returned {status} for {operation}")]
    Status { operation: &'static str, status: u16 },

    /// The named group does not exist in the runtime.
    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    /// The call did not finish before its deadline.
    #[error("runtime call timed out after {0} ms")]
    Timeout(u64),

    /// Controller URL could not be built.
    #[error("invalid controller URL: {0}")]
    Url(#[from] url::ParseError),

    /// The runtime does not implement this capability.
    #[error("{0} is not supported by this runtime")]
    Unsupported(&'static str),

    /// The runtime is not reachable or not running.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
}

/// Result type for runtime calls.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
