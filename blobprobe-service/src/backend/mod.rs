//! Storage backends and the [`StorageBackend`] capability they implement.

use std::time::Duration;

mod azure;
mod common;
mod in_memory;
pub mod sas;

pub use azure::{AzureBlobBackend, AzureCredential, STORAGE_VERSION};
pub use common::{
    BackendError, BackendResult, BlobReference, BoxedBackend, DelegatedUrl, StorageBackend,
    USER_AGENT,
};
pub use in_memory::{InMemoryBackend, Operation};
pub use sas::AccountKey;

/// Configuration to initialize a [`StorageBackend`].
#[derive(Debug)]
pub enum StorageConfig<'a> {
    /// Azure Blob Storage, addressed through its REST API.
    Azure {
        /// The storage account name, used for request signing.
        account: &'a str,
        /// Blob service endpoint.
        ///
        /// Defaults to `https://<account>.blob.core.windows.net`.
        endpoint: Option<&'a str>,
        /// The container holding all test blobs.
        container: &'a str,
        /// Credentials for authenticated requests.
        credential: AzureCredential,
        /// Bound for every single HTTP request.
        request_timeout: Duration,
    },
    /// A process-local map, useful for dry runs.
    Memory {
        /// The name reported as container of all blobs.
        container: &'a str,
    },
}

/// Creates the backend described by `config`.
pub fn create_backend(config: StorageConfig<'_>) -> BackendResult<BoxedBackend> {
    Ok(match config {
        StorageConfig::Azure {
            account,
            endpoint,
            container,
            credential,
            request_timeout,
        } => {
            let endpoint = match endpoint {
                Some(endpoint) => endpoint.to_owned(),
                None => format!("https://{account}.blob.core.windows.net"),
            };
            Box::new(AzureBlobBackend::new(
                account,
                &endpoint,
                container,
                credential,
                request_timeout,
            )?)
        }
        StorageConfig::Memory { container } => Box::new(InMemoryBackend::new(container)),
    })
}
