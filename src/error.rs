//! Error taxonomy shared by the print pipeline and the fleet synchroniser.
//!
//! Remote collaborators return [`RemoteError`], which carries the server's message
//! verbatim. Everything the crate itself decides to reject is an [`Error`] variant.

use thiserror::Error;

/// Failure reported by a remote API (processing or fleet). The message is passed
/// through untouched so it can be shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RemoteError(pub String);

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        RemoteError(message.into())
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        RemoteError(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("remote call failed: {0}")]
    RemoteCallFailed(String),

    #[error("mesh analysis found problems: {}", .problems.join(", "))]
    AnalysisFailed { problems: Vec<String> },

    #[error("the print tray has not been successfully prepared")]
    NotPrepared,

    #[error("no meshes to prepare")]
    NoMeshes,

    #[error("prepared tray returned {actual} meshes for {expected} submitted")]
    TrayMismatch { expected: usize, actual: usize },

    #[error("no active job")]
    NoActiveJob,

    #[error("printer status did not change after {attempts} polls")]
    Timeout { attempts: u32 },

    #[error("unknown printer: {0}")]
    UnknownPrinter(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Error::RemoteCallFailed(e.0)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
