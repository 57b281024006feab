use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Timelike, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};

use super::common::{
    BackendError, BackendResult, BlobReference, DelegatedUrl, StorageBackend, reqwest_client,
};
use super::sas::{self, AccountKey, BlobSas};
use crate::payload;

/// The blob service REST API version used for requests and signed URLs.
pub const STORAGE_VERSION: &str = "2021-08-06";

/// How far SAS start times are backdated to tolerate clock skew with the service.
const CLOCK_SKEW_SECS: i64 = 5 * 60;

/// Credentials used for authenticated (non-delegated) requests.
#[derive(Debug)]
pub enum AzureCredential {
    /// The storage account key. Signs requests and delegated URLs.
    SharedKey(AccountKey),
    /// A short-lived OAuth token.
    ///
    /// Tokens authorize uploads and deletes, but cannot sign a service SAS.
    BearerToken(SecretString),
}

/// Azure Blob Storage backend speaking the REST API.
#[derive(Debug)]
pub struct AzureBlobBackend {
    /// Client for requests authorized by [`AzureCredential`].
    client: reqwest::Client,
    /// Credential-free client for delegated URLs.
    anonymous: reqwest::Client,

    account: String,
    endpoint: Url,
    container: String,
    credential: AzureCredential,
}

impl AzureBlobBackend {
    /// Creates a backend for `container` in `account`, reachable at `endpoint`.
    ///
    /// For development storage, the endpoint contains the account as path, e.g.
    /// `http://127.0.0.1:10000/devstoreaccount1`.
    pub fn new(
        account: &str,
        endpoint: &str,
        container: &str,
        credential: AzureCredential,
        request_timeout: Duration,
    ) -> BackendResult<Self> {
        let endpoint = Url::parse(endpoint).map_err(|err| BackendError::InvalidUrl {
            context: format!("endpoint `{endpoint}`: {err}"),
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl {
                context: format!("endpoint `{endpoint}` cannot hold a path"),
            });
        }

        Ok(Self {
            client: reqwest_client(request_timeout)?,
            anonymous: reqwest_client(request_timeout)?,
            account: account.to_owned(),
            endpoint,
            container: container.to_owned(),
            credential,
        })
    }

    fn blob_url(&self, blob: &BlobReference) -> BackendResult<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| BackendError::InvalidUrl {
                context: format!("endpoint `{}` cannot hold a path", self.endpoint),
            })?
            .pop_if_empty()
            .push(blob.container())
            .push(blob.name());
        Ok(url)
    }

    fn check_reference(&self, blob: &BlobReference) -> BackendResult<()> {
        if blob.container() != self.container || blob.name().is_empty() {
            return Err(BackendError::InvalidReference(blob.clone()));
        }
        Ok(())
    }

    /// Adds date, version and authorization headers to a request for `url`.
    fn authorize(
        &self,
        method: &Method,
        url: &Url,
        mut headers: HeaderMap,
        content_length: Option<u64>,
    ) -> BackendResult<HeaderMap> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        headers.insert("x-ms-date", HeaderValue::from_str(&date)?);
        headers.insert("x-ms-version", HeaderValue::from_static(STORAGE_VERSION));

        let authorization = match self.credential {
            AzureCredential::SharedKey(ref key) => {
                let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
                let string_to_sign = sas::shared_key_string_to_sign(
                    method.as_str(),
                    &headers,
                    content_length,
                    &self.account,
                    url.path(),
                    &query,
                );
                sas::shared_key_authorization(&self.account, key, &string_to_sign)
            }
            AzureCredential::BearerToken(ref token) => format!("Bearer {}", token.expose_secret()),
        };

        let mut authorization = HeaderValue::from_str(&authorization)?;
        authorization.set_sensitive(true);
        headers.insert(AUTHORIZATION, authorization);

        Ok(headers)
    }
}

fn status_error(response: &Response, context: &str) -> BackendError {
    BackendError::Status {
        context: context.to_owned(),
        status: response.status(),
        code: response
            .headers()
            .get("x-ms-error-code")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned),
    }
}

fn whole_seconds(time: DateTime<Utc>) -> DateTime<Utc> {
    time.with_nanosecond(0).unwrap_or(time)
}

/// Rounds up to the next whole second, so that a URL is never valid for less than its TTL.
fn next_whole_second(time: DateTime<Utc>) -> DateTime<Utc> {
    let floor = whole_seconds(time);
    if floor == time {
        time
    } else {
        floor + TimeDelta::seconds(1)
    }
}

#[async_trait::async_trait]
impl StorageBackend for AzureBlobBackend {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn blob_reference(&self, name: &str) -> BlobReference {
        BlobReference::new(&self.container, name)
    }

    #[tracing::instrument(level = "trace", fields(blob = name), skip_all)]
    async fn put_blob(&self, name: &str, payload: Bytes) -> BackendResult<BlobReference> {
        tracing::debug!(size = payload.len(), "Uploading to azure backend");
        let blob = self.blob_reference(name);
        self.check_reference(&blob)?;
        let url = self.blob_url(&blob)?;

        let mut headers = HeaderMap::new();
        headers.insert("x-ms-blob-type", HeaderValue::from_static("BlockBlob"));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(payload::CONTENT_TYPE),
        );
        let headers = self.authorize(&Method::PUT, &url, headers, Some(payload.len() as u64))?;

        let response = self
            .client
            .put(url)
            .headers(headers)
            .body(payload)
            .send()
            .await
            .map_err(|cause| BackendError::reqwest("failed to send upload request", cause))?;

        if !response.status().is_success() {
            return Err(status_error(&response, "upload rejected"));
        }

        Ok(blob)
    }

    #[tracing::instrument(level = "trace", fields(%blob), skip_all)]
    async fn issue_read_url(
        &self,
        blob: &BlobReference,
        ttl: Duration,
    ) -> BackendResult<DelegatedUrl> {
        self.check_reference(blob)?;
        let AzureCredential::SharedKey(ref key) = self.credential else {
            return Err(BackendError::MissingSigningKey);
        };
        let ttl_delta = TimeDelta::from_std(ttl).map_err(|_| BackendError::InvalidTtl(ttl))?;

        let issued_at = Utc::now();
        let now = whole_seconds(issued_at);
        let sas = BlobSas {
            account: self.account.clone(),
            container: blob.container().to_owned(),
            blob: blob.name().to_owned(),
            permissions: "r".to_owned(),
            start: now - TimeDelta::seconds(CLOCK_SKEW_SECS),
            expiry: next_whole_second(issued_at + ttl_delta),
            // Development storage is served over plain HTTP.
            protocol: (self.endpoint.scheme() == "https").then(|| "https".to_owned()),
            version: STORAGE_VERSION.to_owned(),
        };

        let mut url = self.blob_url(blob)?;
        url.query_pairs_mut().extend_pairs(sas.query_pairs(key));
        tracing::debug!(expires_at = %sas.expiry, "Signed delegated read URL");

        Ok(DelegatedUrl::new(url, blob.clone(), issued_at, sas.expiry))
    }

    #[tracing::instrument(level = "trace", fields(blob = %url.blob()), skip_all)]
    async fn get_via_url(&self, url: &DelegatedUrl) -> BackendResult<Bytes> {
        url.ensure_fresh(Utc::now())?;
        tracing::debug!("Downloading from azure backend via delegated URL");

        let response = self
            .anonymous
            .get(url.url().clone())
            .send()
            .await
            .map_err(|cause| BackendError::reqwest("failed to send download request", cause))?;

        match response.status() {
            status if status.is_success() => response
                .bytes()
                .await
                .map_err(|cause| BackendError::reqwest("failed to read download body", cause)),
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(url.blob().clone())),
            // The service may reject a URL that expired while the request was in flight.
            StatusCode::FORBIDDEN if url.is_expired_at(Utc::now()) => {
                Err(BackendError::SasExpired {
                    blob: url.blob().clone(),
                    expired_at: url.expires_at(),
                })
            }
            _ => Err(status_error(&response, "download rejected")),
        }
    }

    #[tracing::instrument(level = "trace", fields(%blob), skip_all)]
    async fn delete_blob(&self, blob: &BlobReference) -> BackendResult<()> {
        tracing::debug!("Deleting from azure backend");
        self.check_reference(blob)?;
        let url = self.blob_url(blob)?;
        let headers = self.authorize(&Method::DELETE, &url, HeaderMap::new(), None)?;

        let response = self
            .client
            .delete(url)
            .headers(headers)
            .send()
            .await
            .map_err(|cause| BackendError::reqwest("failed to send delete request", cause))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                tracing::debug!("Blob already deleted");
                Ok(())
            }
            _ => Err(status_error(&response, "delete rejected")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_KEY: &str =
        "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

    fn backend(endpoint: &str, credential: AzureCredential) -> AzureBlobBackend {
        AzureBlobBackend::new(
            "devstoreaccount1",
            endpoint,
            "performance-test",
            credential,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn shared_key() -> AzureCredential {
        AzureCredential::SharedKey(AccountKey::from_base64(DEV_KEY).unwrap())
    }

    #[test]
    fn builds_blob_urls() {
        let backend = backend("https://myaccount.blob.core.windows.net", shared_key());
        let blob = backend.blob_reference("test_1_abc");
        assert_eq!(
            backend.blob_url(&blob).unwrap().as_str(),
            "https://myaccount.blob.core.windows.net/performance-test/test_1_abc"
        );

        let backend = self::backend("http://127.0.0.1:10000/devstoreaccount1/", shared_key());
        assert_eq!(
            backend.blob_url(&blob).unwrap().as_str(),
            "http://127.0.0.1:10000/devstoreaccount1/performance-test/test_1_abc"
        );
    }

    #[test]
    fn rejects_invalid_endpoint() {
        let result = AzureBlobBackend::new(
            "devstoreaccount1",
            "not a url",
            "performance-test",
            shared_key(),
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(BackendError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn signs_read_only_urls() {
        let backend = backend("https://myaccount.blob.core.windows.net", shared_key());
        let blob = backend.blob_reference("test_1_abc");

        let url = backend
            .issue_read_url(&blob, Duration::from_secs(3600))
            .await
            .unwrap();

        let query: Vec<(String, String)> = url.url().query_pairs().into_owned().collect();
        let param = |name: &str| {
            query
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        assert_eq!(param("sp"), Some("r"));
        assert_eq!(param("sr"), Some("b"));
        assert_eq!(param("spr"), Some("https"));
        assert_eq!(param("sv"), Some(STORAGE_VERSION));
        assert!(param("sig").is_some());

        assert_eq!(url.blob(), &blob);
        let ttl = url.expires_at() - url.issued_at();
        assert!(ttl >= TimeDelta::hours(1));
        assert!(ttl < TimeDelta::hours(1) + TimeDelta::seconds(1));
    }

    #[tokio::test]
    async fn sub_second_ttl_outlives_issue() {
        let backend = backend("https://myaccount.blob.core.windows.net", shared_key());
        let blob = backend.blob_reference("test_1_abc");

        let url = backend
            .issue_read_url(&blob, Duration::from_millis(900))
            .await
            .unwrap();

        assert!(url.expires_at() - url.issued_at() >= TimeDelta::milliseconds(900));
        assert_eq!(url.expires_at().nanosecond(), 0);
        url.ensure_fresh(url.issued_at()).unwrap();
    }

    #[test]
    fn expiry_rounds_up_to_whole_seconds() {
        let exact = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(next_whole_second(exact), exact);

        let fractional = DateTime::from_timestamp(1_700_000_000, 1).unwrap();
        assert_eq!(
            next_whole_second(fractional),
            exact + TimeDelta::seconds(1)
        );
    }

    #[tokio::test]
    async fn bearer_token_cannot_sign() {
        let credential = AzureCredential::BearerToken(SecretString::from("token"));
        let backend = backend("https://myaccount.blob.core.windows.net", credential);
        let blob = backend.blob_reference("test_1_abc");

        let result = backend.issue_read_url(&blob, Duration::from_secs(60)).await;
        assert!(matches!(result, Err(BackendError::MissingSigningKey)));
    }

    #[tokio::test]
    async fn rejects_foreign_references() {
        let backend = backend("https://myaccount.blob.core.windows.net", shared_key());
        let foreign = BlobReference::new("other-container", "test_1_abc");

        let result = backend.issue_read_url(&foreign, Duration::from_secs(60)).await;
        assert!(matches!(result, Err(BackendError::InvalidReference(_))));
    }
}
