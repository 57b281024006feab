use std::error::Error as StdError;

use thiserror::Error;

use crate::backend::{BackendError, BlobReference};
use crate::verify::VerificationError;

/// Errors that end the measurement part of a run.
///
/// Each variant names the step that failed. Cleanup runs regardless of the variant.
#[derive(Debug, Error)]
pub enum RunError {
    /// The payload could not be uploaded.
    #[error("upload failed")]
    Upload(#[source] BackendError),

    /// No delegated read URL could be issued for the uploaded blob.
    #[error("issuing delegated read URL failed")]
    Sas(#[source] BackendError),

    /// The delegated read URL expired before the download went through.
    #[error("download failed, delegated URL expired")]
    SasExpired(#[source] BackendError),

    /// The download through the delegated read URL failed.
    #[error("download failed")]
    Download(#[source] BackendError),

    /// The downloaded content differs from the upload.
    #[error("verification failed")]
    Verification(#[from] VerificationError),

    /// The run was cancelled from the outside.
    #[error("run interrupted before completion")]
    Interrupted,
}

impl RunError {
    /// Wraps a download error, keeping expiry distinct from other failures.
    pub(crate) fn download(error: BackendError) -> Self {
        match error {
            BackendError::SasExpired { .. } => Self::SasExpired(error),
            error => Self::Download(error),
        }
    }

    /// Returns the underlying backend error, if any.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Self::Upload(error)
            | Self::Sas(error)
            | Self::SasExpired(error)
            | Self::Download(error) => Some(error),
            Self::Verification(_) | Self::Interrupted => None,
        }
    }
}

/// Deleting the blob of a run failed.
///
/// This is logged and recorded, but never changes the outcome of a run.
#[derive(Debug, Error)]
#[error("failed to delete blob `{blob}`")]
pub struct CleanupError {
    /// The blob that may have been left behind.
    pub blob: BlobReference,
    /// The backend failure.
    #[source]
    pub cause: BackendError,
}

/// Renders `error` followed by all of its sources, separated by colons.
pub fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
