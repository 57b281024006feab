//! Integrity checks of downloaded payloads.

use thiserror::Error;

use crate::payload::PayloadFingerprint;

/// Downloaded content differs from the uploaded payload.
///
/// This is a correctness defect of the storage path, never a transient condition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerificationError {
    /// The downloaded size differs from the uploaded size.
    #[error("size mismatch: uploaded {expected} bytes, downloaded {actual} bytes")]
    LengthMismatch {
        /// Uploaded size in bytes.
        expected: u64,
        /// Downloaded size in bytes.
        actual: u64,
    },

    /// Sizes match, but the content does not.
    #[error("content mismatch: expected sha256 {expected}, got {actual}")]
    DigestMismatch {
        /// Hex digest of the uploaded payload.
        expected: String,
        /// Hex digest of the downloaded bytes.
        actual: String,
    },
}

/// Checks `downloaded` against the fingerprint of the uploaded payload.
///
/// The length is compared first, so a truncated download is reported with both sizes.
pub fn verify(expected: &PayloadFingerprint, downloaded: &[u8]) -> Result<(), VerificationError> {
    let actual_len = downloaded.len() as u64;
    if actual_len != expected.len() {
        return Err(VerificationError::LengthMismatch {
            expected: expected.len(),
            actual: actual_len,
        });
    }

    let actual = PayloadFingerprint::of(downloaded);
    if actual.digest() != expected.digest() {
        return Err(VerificationError::DigestMismatch {
            expected: expected.hex_digest(),
            actual: actual.hex_digest(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_identical_content() {
        let fingerprint = PayloadFingerprint::of(b"hello world");
        assert_eq!(verify(&fingerprint, b"hello world"), Ok(()));
    }

    #[test]
    fn reports_truncation_with_both_sizes() {
        let fingerprint = PayloadFingerprint::of(b"hello world");
        let err = verify(&fingerprint, b"hello").unwrap_err();

        assert_eq!(
            err,
            VerificationError::LengthMismatch {
                expected: 11,
                actual: 5
            }
        );
        assert_eq!(
            err.to_string(),
            "size mismatch: uploaded 11 bytes, downloaded 5 bytes"
        );
    }

    #[test]
    fn detects_single_flipped_byte() {
        let fingerprint = PayloadFingerprint::of(b"hello world");
        let err = verify(&fingerprint, b"hello_world").unwrap_err();

        assert!(matches!(err, VerificationError::DigestMismatch { .. }));
    }
}
