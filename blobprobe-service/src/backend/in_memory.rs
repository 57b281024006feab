//! In-memory backend for tests and dry runs.
//!
//! This provides a [`StorageBackend`] backed by a `HashMap`. Delegated URLs are signed
//! with a random per-backend key, so they cannot be forged or reused for another blob.
//!
//! The backend is [`Clone`] so tests can hold a handle for inspection and fault
//! injection while the runner owns a boxed copy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use reqwest::{StatusCode, Url};

use super::common::{BackendError, BackendResult, BlobReference, DelegatedUrl, StorageBackend};
use super::sas::AccountKey;

/// A backend operation, used for fault injection and the call log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`StorageBackend::put_blob`]
    Put,
    /// [`StorageBackend::issue_read_url`]
    IssueUrl,
    /// [`StorageBackend::get_via_url`]
    Get,
    /// [`StorageBackend::delete_blob`]
    Delete,
}

impl Operation {
    /// The error an injected fault produces, modeled after typical service responses.
    fn fault(self) -> BackendError {
        let (status, code) = match self {
            Self::Put => (StatusCode::SERVICE_UNAVAILABLE, "ServerBusy"),
            Self::IssueUrl => (StatusCode::FORBIDDEN, "AuthorizationPermissionMismatch"),
            Self::Get => (StatusCode::SERVICE_UNAVAILABLE, "ServerBusy"),
            Self::Delete => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        BackendError::Status {
            context: format!("injected {self:?} failure"),
            status,
            code: Some(code.to_owned()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Fault {
    Times(usize),
    Always,
}

#[derive(Debug, Default)]
struct State {
    blobs: HashMap<String, Bytes>,
    faults: HashMap<Operation, Fault>,
    calls: Vec<Operation>,
    corrupt_reads: bool,
}

/// A [`StorageBackend`] keeping blobs in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    container: String,
    key: Arc<AccountKey>,
    state: Arc<Mutex<State>>,
    latency: Option<Duration>,
}

impl InMemoryBackend {
    /// Creates an empty backend that reports `container` for all of its blobs.
    pub fn new(container: &str) -> Self {
        Self {
            container: container.to_owned(),
            key: Arc::new(AccountKey::random()),
            state: Arc::new(Mutex::new(State::default())),
            latency: None,
        }
    }

    /// Delays every operation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fails the next `times` calls of `operation`.
    pub fn inject_failure(&self, operation: Operation, times: usize) {
        self.state()
            .faults
            .insert(operation, Fault::Times(times));
    }

    /// Fails every call of `operation`.
    pub fn fail_always(&self, operation: Operation) {
        self.state().faults.insert(operation, Fault::Always);
    }

    /// Flips the first byte of every subsequent download.
    pub fn corrupt_reads(&self) {
        self.state().corrupt_reads = true;
    }

    /// Returns `true` if a blob with the given name is stored.
    pub fn contains(&self, name: &str) -> bool {
        self.state().blobs.contains_key(name)
    }

    /// Returns `true` if the backend has no stored blobs.
    pub fn is_empty(&self) -> bool {
        self.state().blobs.is_empty()
    }

    /// Returns the number of stored blobs.
    pub fn len(&self) -> usize {
        self.state().blobs.len()
    }

    /// Returns all operations called so far, in order, including failed ones.
    pub fn calls(&self) -> Vec<Operation> {
        self.state().calls.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked while holding it.
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Simulates latency, logs the call and fires an injected fault.
    async fn enter(&self, operation: Operation) -> BackendResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        state.calls.push(operation);

        match state.faults.get_mut(&operation) {
            Some(Fault::Always) => Err(operation.fault()),
            Some(Fault::Times(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(operation.fault())
            }
            _ => Ok(()),
        }
    }

    fn check_reference(&self, blob: &BlobReference) -> BackendResult<()> {
        if blob.container() != self.container || blob.name().is_empty() {
            return Err(BackendError::InvalidReference(blob.clone()));
        }
        Ok(())
    }

    fn string_to_sign(blob: &BlobReference, expiry: &str) -> String {
        format!("{}/{}\n{expiry}", blob.container(), blob.name())
    }

    /// Checks that `url` carries a valid signature for exactly the blob it claims.
    fn check_signature(&self, url: &DelegatedUrl) -> BackendResult<()> {
        let invalid = || BackendError::Status {
            context: "delegated URL rejected".to_owned(),
            status: StatusCode::FORBIDDEN,
            code: Some("AuthenticationFailed".to_owned()),
        };

        let segments: Vec<&str> = url.url().path_segments().ok_or_else(invalid)?.collect();
        let [container, name] = segments.as_slice() else {
            return Err(invalid());
        };
        url.ensure_bound_to(&BlobReference::new(*container, *name))?;

        let mut expiry = None;
        let mut signature = None;
        for (key, value) in url.url().query_pairs() {
            match key.as_ref() {
                "se" => expiry = Some(value.into_owned()),
                "sig" => signature = Some(value.into_owned()),
                _ => (),
            }
        }
        let (Some(expiry), Some(signature)) = (expiry, signature) else {
            return Err(invalid());
        };

        let string_to_sign = Self::string_to_sign(url.blob(), &expiry);
        if !self.key.verify(&string_to_sign, &signature) {
            return Err(invalid());
        }

        let expires_at = DateTime::parse_from_rfc3339(&expiry)
            .map_err(|_| invalid())?
            .with_timezone(&Utc);
        if Utc::now() >= expires_at {
            return Err(BackendError::SasExpired {
                blob: url.blob().clone(),
                expired_at: expires_at,
            });
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn blob_reference(&self, name: &str) -> BlobReference {
        BlobReference::new(&self.container, name)
    }

    async fn put_blob(&self, name: &str, payload: Bytes) -> BackendResult<BlobReference> {
        self.enter(Operation::Put).await?;
        let blob = self.blob_reference(name);
        self.check_reference(&blob)?;

        self.state().blobs.insert(name.to_owned(), payload);
        Ok(blob)
    }

    async fn issue_read_url(
        &self,
        blob: &BlobReference,
        ttl: Duration,
    ) -> BackendResult<DelegatedUrl> {
        self.enter(Operation::IssueUrl).await?;
        self.check_reference(blob)?;
        let ttl_delta = TimeDelta::from_std(ttl).map_err(|_| BackendError::InvalidTtl(ttl))?;

        let issued_at = Utc::now();
        let expires_at = issued_at + ttl_delta;
        let expiry = expires_at.to_rfc3339_opts(SecondsFormat::Micros, true);
        let signature = self.key.sign(&Self::string_to_sign(blob, &expiry));

        let mut url = Url::parse("memory://localhost/").map_err(|err| BackendError::InvalidUrl {
            context: err.to_string(),
        })?;
        url.path_segments_mut()
            .map_err(|()| BackendError::InvalidUrl {
                context: "memory URL cannot hold a path".to_owned(),
            })?
            .clear()
            .push(blob.container())
            .push(blob.name());
        url.query_pairs_mut()
            .append_pair("se", &expiry)
            .append_pair("sig", &signature);

        // The signed expiry has microsecond precision.
        let expires_at = DateTime::parse_from_rfc3339(&expiry)
            .map(|time| time.with_timezone(&Utc))
            .unwrap_or(expires_at);

        Ok(DelegatedUrl::new(url, blob.clone(), issued_at, expires_at))
    }

    async fn get_via_url(&self, url: &DelegatedUrl) -> BackendResult<Bytes> {
        self.enter(Operation::Get).await?;
        url.ensure_fresh(Utc::now())?;
        self.check_signature(url)?;

        let state = self.state();
        let bytes = state
            .blobs
            .get(url.blob().name())
            .cloned()
            .ok_or_else(|| BackendError::NotFound(url.blob().clone()))?;

        if state.corrupt_reads && !bytes.is_empty() {
            let mut corrupted = bytes.to_vec();
            corrupted[0] ^= 0xff;
            return Ok(corrupted.into());
        }
        Ok(bytes)
    }

    async fn delete_blob(&self, blob: &BlobReference) -> BackendResult<()> {
        self.enter(Operation::Delete).await?;
        self.check_reference(blob)?;

        self.state().blobs.remove(blob.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_lifecycle() {
        let backend = InMemoryBackend::new("performance-test");

        let blob = backend
            .put_blob("test_1", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert!(backend.contains("test_1"));

        let url = backend
            .issue_read_url(&blob, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(url.url().scheme(), "memory");
        let bytes = backend.get_via_url(&url).await.unwrap();
        assert_eq!(bytes.as_ref(), b"hello");

        backend.delete_blob(&blob).await.unwrap();
        assert!(backend.is_empty());

        // idempotent
        backend.delete_blob(&blob).await.unwrap();

        assert_eq!(
            backend.calls(),
            [
                Operation::Put,
                Operation::IssueUrl,
                Operation::Get,
                Operation::Delete,
                Operation::Delete
            ]
        );
    }

    #[tokio::test]
    async fn rejects_tampered_urls() {
        let backend = InMemoryBackend::new("performance-test");
        let blob = backend
            .put_blob("test_1", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        backend
            .put_blob("test_2", Bytes::from_static(b"other"))
            .await
            .unwrap();
        let url = backend
            .issue_read_url(&blob, Duration::from_secs(60))
            .await
            .unwrap();

        // Point the signed URL at another blob.
        let mut tampered_url = url.url().clone();
        tampered_url.set_path("/performance-test/test_2");
        let other = backend.blob_reference("test_2");
        let tampered = DelegatedUrl::new(tampered_url, other, url.issued_at(), url.expires_at());

        let err = backend.get_via_url(&tampered).await.unwrap_err();
        assert!(matches!(err, BackendError::Status { status, .. } if status == StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn urls_of_other_backends_are_rejected() {
        let first = InMemoryBackend::new("performance-test");
        let second = InMemoryBackend::new("performance-test");
        let blob = first
            .put_blob("test_1", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        second
            .put_blob("test_1", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let url = first
            .issue_read_url(&blob, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(second.get_via_url(&url).await.is_err());
    }

    #[tokio::test]
    async fn expired_urls_are_rejected() {
        let backend = InMemoryBackend::new("performance-test");
        let blob = backend
            .put_blob("test_1", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let url = backend
            .issue_read_url(&blob, Duration::from_millis(1))
            .await
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let err = backend.get_via_url(&url).await.unwrap_err();
        assert!(matches!(err, BackendError::SasExpired { .. }));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = InMemoryBackend::new("performance-test");
        backend.inject_failure(Operation::Put, 2);

        let payload = Bytes::from_static(b"hello");
        assert!(backend.put_blob("test_1", payload.clone()).await.is_err());
        let err = backend.put_blob("test_1", payload.clone()).await.unwrap_err();
        assert!(err.is_transient());
        backend.put_blob("test_1", payload).await.unwrap();

        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn corrupts_reads_on_request() {
        let backend = InMemoryBackend::new("performance-test");
        let blob = backend
            .put_blob("test_1", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        backend.corrupt_reads();

        let url = backend
            .issue_read_url(&blob, Duration::from_secs(60))
            .await
            .unwrap();
        let bytes = backend.get_via_url(&url).await.unwrap();
        assert_eq!(bytes.len(), 5);
        assert_ne!(bytes.as_ref(), b"hello");
    }
}
