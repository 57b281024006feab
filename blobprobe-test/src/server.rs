//! Exposes an in-process blob endpoint for use in integration tests.
//!
//! The server speaks the subset of the Azure Blob REST API used by blobprobe: uploading,
//! downloading and deleting block blobs. Requests are authenticated like the real
//! service would, using Shared Key signatures, a fixed bearer token, or a service SAS.
//!
//! ```
//! use blobprobe_test::server::TestServer;
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = TestServer::new().await;
//!    let endpoint = server.endpoint();
//!    // point an Azure backend at the endpoint...
//! }
//! ```

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use blobprobe_service::backend::sas::{self, AccountKey, BlobSas};
use chrono::Utc;

/// The account name served by [`TestServer`].
pub const ACCOUNT: &str = "devstoreaccount1";

/// The account key accepted by [`TestServer`], the well-known development storage key.
pub const ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

/// The only bearer token accepted by [`TestServer`].
pub const BEARER_TOKEN: &str = "test-token";

type BlobKey = (String, String);

#[derive(Debug, Default)]
struct Storage {
    blobs: HashMap<BlobKey, Bytes>,
    content_types: HashMap<BlobKey, String>,
    reject_writes: bool,
}

#[derive(Clone, Debug)]
struct AppState {
    key: Arc<AccountKey>,
    storage: Arc<Mutex<Storage>>,
}

impl AppState {
    fn storage(&self) -> MutexGuard<'_, Storage> {
        self.storage.lock().unwrap()
    }
}

/// An in-process blob endpoint for use in integration tests.
///
/// Blobs are kept in memory and dropped together with the server. It listens on a random
/// available port on localhost.
#[derive(Debug)]
pub struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    state: AppState,
}

impl TestServer {
    /// Starts a server with empty storage.
    pub async fn new() -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let state = AppState {
            key: Arc::new(AccountKey::from_base64(ACCOUNT_KEY).unwrap()),
            storage: Default::default(),
        };

        let app = Router::new()
            .route(
                "/{account}/{container}/{blob}",
                put(put_blob).get(get_blob).delete(delete_blob),
            )
            .with_state(state.clone());

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            handle,
            socket,
            state,
        }
    }

    /// Returns the blob service endpoint, including the account.
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}/{ACCOUNT}", self.socket.port())
    }

    /// Returns `true` if the container holds a blob with the given name.
    pub fn contains(&self, container: &str, blob: &str) -> bool {
        self.state
            .storage()
            .blobs
            .contains_key(&(container.to_owned(), blob.to_owned()))
    }

    /// Returns the content of a blob, if it exists.
    pub fn blob(&self, container: &str, blob: &str) -> Option<Bytes> {
        self.state
            .storage()
            .blobs
            .get(&(container.to_owned(), blob.to_owned()))
            .cloned()
    }

    /// Returns the `Content-Type` a blob was uploaded with, if any.
    pub fn content_type(&self, container: &str, blob: &str) -> Option<String> {
        self.state
            .storage()
            .content_types
            .get(&(container.to_owned(), blob.to_owned()))
            .cloned()
    }

    /// Returns the total number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.state.storage().blobs.len()
    }

    /// Makes all uploads fail as if the credentials lacked write permission.
    pub fn reject_writes(&self, reject: bool) {
        self.state.storage().reject_writes = reject;
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn error(status: StatusCode, code: &'static str) -> Response {
    (status, [("x-ms-error-code", code)], code).into_response()
}

fn query_pairs(uri: &Uri) -> Vec<(String, String)> {
    url::form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
        .into_owned()
        .collect()
}

/// Checks Shared Key or bearer authorization of a request.
fn authorize(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    content_length: u64,
) -> Result<(), Response> {
    if !headers.contains_key("x-ms-version") || !headers.contains_key("x-ms-date") {
        return Err(error(StatusCode::BAD_REQUEST, "MissingRequiredHeader"));
    }

    let Some(authorization) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return Err(error(StatusCode::FORBIDDEN, "NoAuthenticationInformation"));
    };

    if let Some(token) = authorization.strip_prefix("Bearer ") {
        if token != BEARER_TOKEN {
            return Err(error(StatusCode::UNAUTHORIZED, "InvalidAuthenticationInfo"));
        }
        return Ok(());
    }

    let Some((account, signature)) = sas::parse_shared_key_authorization(authorization) else {
        return Err(error(StatusCode::FORBIDDEN, "AuthenticationFailed"));
    };
    let string_to_sign = sas::shared_key_string_to_sign(
        method.as_str(),
        headers,
        Some(content_length),
        account,
        uri.path(),
        &query_pairs(uri),
    );
    if account != ACCOUNT || !state.key.verify(&string_to_sign, signature) {
        return Err(error(StatusCode::FORBIDDEN, "AuthenticationFailed"));
    }

    Ok(())
}

/// Checks a service SAS granting read access to `container/blob`.
fn authorize_sas(state: &AppState, uri: &Uri, container: &str, blob: &str) -> Result<(), Response> {
    let query = query_pairs(uri);
    let Ok((sas, signature)) = BlobSas::from_query(ACCOUNT, container, blob, &query) else {
        return Err(error(StatusCode::FORBIDDEN, "AuthenticationFailed"));
    };

    if !state.key.verify(&sas.string_to_sign(), &signature) {
        return Err(error(StatusCode::FORBIDDEN, "AuthenticationFailed"));
    }
    if !sas.is_valid_at(Utc::now()) {
        return Err(error(StatusCode::FORBIDDEN, "AuthenticationFailed"));
    }
    if !sas.permissions.contains('r') {
        return Err(error(StatusCode::FORBIDDEN, "AuthorizationPermissionMismatch"));
    }

    Ok(())
}

async fn put_blob(
    State(state): State<AppState>,
    Path((account, container, blob)): Path<(String, String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if account != ACCOUNT {
        return error(StatusCode::NOT_FOUND, "ResourceNotFound");
    }
    if let Err(response) = authorize(&state, &method, &uri, &headers, body.len() as u64) {
        return response;
    }
    if headers.get("x-ms-blob-type").and_then(|v| v.to_str().ok()) != Some("BlockBlob") {
        return error(StatusCode::BAD_REQUEST, "MissingRequiredHeader");
    }

    let mut storage = state.storage();
    if storage.reject_writes {
        return error(StatusCode::FORBIDDEN, "AuthorizationPermissionMismatch");
    }
    let key = (container, blob);
    match headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(content_type) => storage.content_types.insert(key.clone(), content_type.to_owned()),
        None => storage.content_types.remove(&key),
    };
    storage.blobs.insert(key, body);

    StatusCode::CREATED.into_response()
}

async fn get_blob(
    State(state): State<AppState>,
    Path((account, container, blob)): Path<(String, String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if account != ACCOUNT {
        return error(StatusCode::NOT_FOUND, "ResourceNotFound");
    }

    let authorized = match uri.query() {
        Some(query) if query.contains("sig=") => authorize_sas(&state, &uri, &container, &blob),
        _ => authorize(&state, &method, &uri, &headers, 0),
    };
    if let Err(response) = authorized {
        return response;
    }

    match state.storage().blobs.get(&(container, blob)) {
        Some(bytes) => bytes.clone().into_response(),
        None => error(StatusCode::NOT_FOUND, "BlobNotFound"),
    }
}

async fn delete_blob(
    State(state): State<AppState>,
    Path((account, container, blob)): Path<(String, String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if account != ACCOUNT {
        return error(StatusCode::NOT_FOUND, "ResourceNotFound");
    }
    if let Err(response) = authorize(&state, &method, &uri, &headers, 0) {
        return response;
    }

    let key = (container, blob);
    let mut storage = state.storage();
    storage.content_types.remove(&key);
    match storage.blobs.remove(&key) {
        Some(_) => StatusCode::ACCEPTED.into_response(),
        None => error(StatusCode::NOT_FOUND, "BlobNotFound"),
    }
}
