use std::fmt;

use serde::Serialize;

use crate::error::RunError;

/// The terminal result of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// All steps completed and the download matched the upload.
    Success,
    /// The upload failed.
    UploadFailed,
    /// Issuing the delegated read URL failed.
    SasFailed,
    /// The download failed, including downloads with an expired URL.
    DownloadFailed,
    /// The downloaded content differs from the upload.
    VerificationFailed,
    /// The run was cancelled before it completed.
    Interrupted,
}

impl Outcome {
    /// The process exit status for this outcome.
    ///
    /// Every failure class has its own code to simplify triage in CI logs. `130` is the
    /// conventional status of a process terminated by `SIGINT`.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::UploadFailed => 2,
            Self::SasFailed => 3,
            Self::DownloadFailed => 4,
            Self::VerificationFailed => 5,
            Self::Interrupted => 130,
        }
    }

    /// Returns `true` only for [`Outcome::Success`].
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// The snake case name, as used in the run record.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::UploadFailed => "upload_failed",
            Self::SasFailed => "sas_failed",
            Self::DownloadFailed => "download_failed",
            Self::VerificationFailed => "verification_failed",
            Self::Interrupted => "interrupted",
        }
    }
}

impl From<&RunError> for Outcome {
    fn from(error: &RunError) -> Self {
        match error {
            RunError::Upload(_) => Self::UploadFailed,
            RunError::Sas(_) => Self::SasFailed,
            RunError::SasExpired(_) | RunError::Download(_) => Self::DownloadFailed,
            RunError::Verification(_) => Self::VerificationFailed,
            RunError::Interrupted => Self::Interrupted,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BlobReference};
    use crate::verify::VerificationError;

    #[test]
    fn exit_codes_are_distinct() {
        let outcomes = [
            Outcome::Success,
            Outcome::UploadFailed,
            Outcome::SasFailed,
            Outcome::DownloadFailed,
            Outcome::VerificationFailed,
            Outcome::Interrupted,
        ];

        let codes: std::collections::HashSet<u8> =
            outcomes.iter().map(|outcome| outcome.exit_code()).collect();
        assert_eq!(codes.len(), outcomes.len());
        assert_eq!(Outcome::Success.exit_code(), 0);
        assert!(outcomes[1..].iter().all(|outcome| outcome.exit_code() != 0));
    }

    #[test]
    fn serializes_snake_case() {
        for outcome in [Outcome::Success, Outcome::VerificationFailed, Outcome::SasFailed] {
            let json = serde_json::to_string(&outcome).unwrap();
            assert_eq!(json, format!("\"{}\"", outcome.as_str()));
        }
    }

    #[test]
    fn expired_download_is_download_failure() {
        let expired = BackendError::SasExpired {
            blob: BlobReference::new("perf", "blob"),
            expired_at: chrono::Utc::now(),
        };
        let error = RunError::download(expired);

        assert!(matches!(error, RunError::SasExpired(_)));
        assert_eq!(Outcome::from(&error), Outcome::DownloadFailed);
        assert!(error.to_string().contains("expired"));
    }

    #[test]
    fn verification_is_distinct_from_transport() {
        let error = RunError::from(VerificationError::LengthMismatch {
            expected: 2,
            actual: 1,
        });
        assert_eq!(Outcome::from(&error), Outcome::VerificationFailed);
        assert!(error.backend_error().is_none());
    }
}
