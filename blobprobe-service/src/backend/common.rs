use std::fmt::{self, Debug};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::InvalidHeaderValue;
use reqwest::{StatusCode, Url};
use thiserror::Error;

/// User agent string used for outgoing requests.
pub const USER_AGENT: &str = concat!("blobprobe/", env!("CARGO_PKG_VERSION"));

/// A type-erased [`StorageBackend`] instance.
pub type BoxedBackend = Box<dyn StorageBackend>;

/// The operations a run performs against an object store.
///
/// None of the methods measure themselves. The caller samples timestamps around each
/// call and bounds it with a timeout.
#[async_trait::async_trait]
pub trait StorageBackend: Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics and the run record.
    fn name(&self) -> &'static str;

    /// Returns the reference a blob named `name` has in this backend.
    ///
    /// This is the handle [`put_blob`](Self::put_blob) returns on success. It is needed
    /// up front, since a failed or interrupted upload may still have created the blob.
    fn blob_reference(&self, name: &str) -> BlobReference;

    /// Uploads `payload` under `name`, overwriting any existing blob.
    async fn put_blob(&self, name: &str, payload: Bytes) -> BackendResult<BlobReference>;

    /// Issues a read-only URL for `blob` that is valid for `ttl`.
    ///
    /// The URL must be usable by an anonymous client without further credentials.
    async fn issue_read_url(&self, blob: &BlobReference, ttl: Duration)
    -> BackendResult<DelegatedUrl>;

    /// Downloads a blob using nothing but the delegated URL.
    async fn get_via_url(&self, url: &DelegatedUrl) -> BackendResult<Bytes>;

    /// Deletes `blob`. Deleting a blob that does not exist is not an error.
    async fn delete_blob(&self, blob: &BlobReference) -> BackendResult<()>;
}

/// The handle of an uploaded blob: its container and name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobReference {
    container: String,
    name: String,
}

impl BlobReference {
    /// Creates a reference to `name` within `container`.
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }

    /// The container holding the blob.
    pub fn container(&self) -> &str {
        &self.container
    }

    /// The blob name within its container.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for BlobReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

/// A time-boxed, read-only URL bound to exactly one [`BlobReference`].
#[derive(Clone)]
pub struct DelegatedUrl {
    url: Url,
    blob: BlobReference,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl DelegatedUrl {
    /// Wraps a signed URL together with the blob it grants access to.
    pub fn new(
        url: Url,
        blob: BlobReference,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            url,
            blob,
            issued_at,
            expires_at,
        }
    }

    /// The full URL including its signature.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The blob this URL was issued for.
    pub fn blob(&self) -> &BlobReference {
        &self.blob
    }

    /// When the URL was issued.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// The instant from which the URL is no longer valid.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns `true` if the URL is expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Fails with [`BackendError::SasExpired`] if the URL is expired at `now`.
    pub fn ensure_fresh(&self, now: DateTime<Utc>) -> BackendResult<()> {
        if self.is_expired_at(now) {
            return Err(BackendError::SasExpired {
                blob: self.blob.clone(),
                expired_at: self.expires_at,
            });
        }
        Ok(())
    }

    /// Fails with [`BackendError::ForeignUrl`] unless the URL was issued for `blob`.
    pub fn ensure_bound_to(&self, blob: &BlobReference) -> BackendResult<()> {
        if &self.blob != blob {
            return Err(BackendError::ForeignUrl {
                issued_for: self.blob.clone(),
                requested: blob.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for DelegatedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut url = self.url.clone();
        url.set_query(Some("[redacted]"));

        f.debug_struct("DelegatedUrl")
            .field("url", &url.as_str())
            .field("blob", &self.blob)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Errors returned by [`StorageBackend`] operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Errors stemming from the reqwest client, such as connection failures or timeouts
    /// while sending a request or reading its response.
    #[error("reqwest error: {context}")]
    Reqwest {
        /// What the backend was doing.
        context: String,
        /// The underlying client error.
        #[source]
        cause: reqwest::Error,
    },

    /// The service answered with an unexpected status code.
    #[error("{context}: {status} (error code: {})", .code.as_deref().unwrap_or("none"))]
    Status {
        /// What the backend was doing.
        context: String,
        /// The HTTP status of the response.
        status: StatusCode,
        /// The service-specific error code, if the service sent one.
        code: Option<String>,
    },

    /// The configured credentials cannot sign delegated URLs.
    #[error("no account key available to sign delegated URLs")]
    MissingSigningKey,

    /// A delegated URL was used at or after its expiry.
    #[error("delegated URL for `{blob}` expired at {expired_at}")]
    SasExpired {
        /// The blob the URL was issued for.
        blob: BlobReference,
        /// The expiry of the URL.
        expired_at: DateTime<Utc>,
    },

    /// A delegated URL was presented for a blob it was not issued for.
    #[error("delegated URL for `{issued_for}` cannot be used for `{requested}`")]
    ForeignUrl {
        /// The blob the URL was issued for.
        issued_for: BlobReference,
        /// The blob that was requested with it.
        requested: BlobReference,
    },

    /// The reference does not point into this backend's container.
    #[error("blob reference `{0}` does not belong to this backend")]
    InvalidReference(BlobReference),

    /// A URL could not be built or parsed.
    #[error("invalid URL: {context}")]
    InvalidUrl {
        /// What was being built or parsed.
        context: String,
    },

    /// The blob does not exist.
    #[error("blob `{0}` not found")]
    NotFound(BlobReference),

    /// The operation did not complete within its time bound.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The account key is not valid base64.
    #[error("invalid account key")]
    InvalidAccountKey(#[from] base64::DecodeError),

    /// A header value could not be encoded.
    #[error("invalid header value")]
    InvalidHeader(#[from] InvalidHeaderValue),

    /// The delegated access TTL cannot be represented.
    #[error("TTL of {0:?} is out of range")]
    InvalidTtl(Duration),
}

impl BackendError {
    pub(crate) fn reqwest(context: impl Into<String>, cause: reqwest::Error) -> Self {
        Self::Reqwest {
            context: context.into(),
            cause,
        }
    }

    /// Returns `true` for errors that may succeed when the operation is repeated.
    ///
    /// These are transport failures, timeouts, and server-side throttling or outages.
    /// Authentication, signing, expiry and lookup failures are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Reqwest { cause, .. } => {
                cause.is_timeout() || cause.is_connect() || cause.is_request() || cause.is_body()
            }
            Self::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Creates a reqwest client with required defaults.
pub(crate) fn reqwest_client(timeout: Duration) -> BackendResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|cause| BackendError::reqwest("failed to build HTTP client", cause))
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn url_for(blob: &BlobReference, ttl: TimeDelta) -> DelegatedUrl {
        let issued_at = Utc::now();
        let url = Url::parse("https://example.com/perf/blob?sig=secret").unwrap();
        DelegatedUrl::new(url, blob.clone(), issued_at, issued_at + ttl)
    }

    #[test]
    fn expires_exactly_at_expiry() {
        let blob = BlobReference::new("perf", "blob");
        let url = url_for(&blob, TimeDelta::minutes(5));

        assert!(url.ensure_fresh(url.issued_at()).is_ok());
        assert!(!url.is_expired_at(url.expires_at() - TimeDelta::milliseconds(1)));
        assert!(url.is_expired_at(url.expires_at()));

        let err = url.ensure_fresh(url.expires_at()).unwrap_err();
        assert!(matches!(err, BackendError::SasExpired { .. }));
    }

    #[test]
    fn bound_to_single_blob() {
        let blob = BlobReference::new("perf", "blob");
        let other = BlobReference::new("perf", "other");
        let url = url_for(&blob, TimeDelta::minutes(5));

        assert!(url.ensure_bound_to(&blob).is_ok());
        assert!(matches!(
            url.ensure_bound_to(&other),
            Err(BackendError::ForeignUrl { .. })
        ));
    }

    #[test]
    fn debug_redacts_signature() {
        let blob = BlobReference::new("perf", "blob");
        let url = url_for(&blob, TimeDelta::minutes(5));

        let debug = format!("{url:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("https://example.com/perf/blob"));
    }

    #[test]
    fn transient_classification() {
        let server_busy = BackendError::Status {
            context: "put".into(),
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: Some("ServerBusy".into()),
        };
        assert!(server_busy.is_transient());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_transient());

        let forbidden = BackendError::Status {
            context: "put".into(),
            status: StatusCode::FORBIDDEN,
            code: None,
        };
        assert!(!forbidden.is_transient());
        assert!(!BackendError::MissingSigningKey.is_transient());
    }
}
