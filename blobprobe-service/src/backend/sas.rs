//! Request and URL signing for Azure Blob Storage.
//!
//! Two schemes are implemented, both based on HMAC-SHA256 over a canonical string with
//! the storage account key:
//!
//! - **Shared Key** authorizes individual REST requests (`Put Blob`, `Delete Blob`). See
//!   [`shared_key_string_to_sign`].
//! - **Service SAS** produces a delegated URL granting time-boxed read access to a single
//!   blob without any further credentials. See [`BlobSas`].
//!
//! Both directions are needed: the backend signs, and the test endpoint validates.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use sha2::Sha256;

use super::common::{BackendError, BackendResult};

type HmacSha256 = Hmac<Sha256>;

/// Timestamp format of `st` and `se` SAS parameters.
const SAS_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Headers that are part of the Shared Key string-to-sign, in order, after the verb and
/// before the `Content-Length` slot.
const LEADING_HEADERS: [&str; 2] = ["content-encoding", "content-language"];

/// Headers that follow the `Content-Length` slot, in order.
const TRAILING_HEADERS: [&str; 8] = [
    "content-md5",
    "content-type",
    "date",
    "if-modified-since",
    "if-match",
    "if-none-match",
    "if-unmodified-since",
    "range",
];

/// A decoded storage account key.
#[derive(Clone)]
pub struct AccountKey(Vec<u8>);

impl AccountKey {
    /// Decodes a base64 account key as shown in the Azure portal.
    pub fn from_base64(encoded: &str) -> BackendResult<Self> {
        Ok(Self(STANDARD.decode(encoded.trim())?))
    }

    /// Generates a random 256-bit key.
    pub fn random() -> Self {
        Self(rand::random::<[u8; 32]>().to_vec())
    }

    /// Computes the base64 HMAC-SHA256 signature of `string_to_sign`.
    pub fn sign(&self, string_to_sign: &str) -> String {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC can take key of any size");
        mac.update(string_to_sign.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Checks a base64 signature in constant time.
    pub fn verify(&self, string_to_sign: &str, signature: &str) -> bool {
        let Ok(signature) = STANDARD.decode(signature) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC can take key of any size");
        mac.update(string_to_sign.as_bytes());
        mac.verify_slice(&signature).is_ok()
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccountKey([redacted])")
    }
}

/// Builds the Shared Key string-to-sign of a blob service request.
///
/// - `path` is the percent-encoded URL path as sent on the wire.
/// - `query` holds the decoded query parameters.
/// - `content_length` is the body length. Zero and absent bodies sign the same.
pub fn shared_key_string_to_sign(
    method: &str,
    headers: &HeaderMap,
    content_length: Option<u64>,
    account: &str,
    path: &str,
    query: &[(String, String)],
) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    };

    let mut string_to_sign = format!("{}\n", method.to_ascii_uppercase());
    for name in LEADING_HEADERS {
        string_to_sign.push_str(header(name));
        string_to_sign.push('\n');
    }
    if let Some(length) = content_length.filter(|length| *length > 0) {
        string_to_sign.push_str(&length.to_string());
    }
    string_to_sign.push('\n');
    for name in TRAILING_HEADERS {
        string_to_sign.push_str(header(name));
        string_to_sign.push('\n');
    }

    let mut ms_headers: Vec<_> = headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-ms-"))
        .map(|(name, value)| (name.as_str(), value.to_str().unwrap_or_default().trim()))
        .collect();
    ms_headers.sort_unstable();
    for (name, value) in ms_headers {
        string_to_sign.push_str(name);
        string_to_sign.push(':');
        string_to_sign.push_str(value);
        string_to_sign.push('\n');
    }

    string_to_sign.push('/');
    string_to_sign.push_str(account);
    string_to_sign.push_str(path);

    let mut params: Vec<(String, &str)> = query
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
        .collect();
    params.sort_unstable();
    let mut params = params.into_iter().peekable();
    while let Some((name, value)) = params.next() {
        let mut values = vec![value];
        while let Some((_, next)) = params.next_if(|(next, _)| *next == name) {
            values.push(next);
        }
        string_to_sign.push('\n');
        string_to_sign.push_str(&name);
        string_to_sign.push(':');
        string_to_sign.push_str(&values.join(","));
    }

    string_to_sign
}

/// Formats the value of a Shared Key `Authorization` header.
pub fn shared_key_authorization(account: &str, key: &AccountKey, string_to_sign: &str) -> String {
    format!("SharedKey {account}:{}", key.sign(string_to_sign))
}

/// Parses a Shared Key `Authorization` header into account name and signature.
pub fn parse_shared_key_authorization(value: &str) -> Option<(&str, &str)> {
    value.strip_prefix("SharedKey ")?.split_once(':')
}

/// A read-only service SAS for a single blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobSas {
    /// The storage account the blob lives in.
    pub account: String,
    /// The container of the blob.
    pub container: String,
    /// The blob name.
    pub blob: String,
    /// Granted permissions, `r` for read-only access.
    pub permissions: String,
    /// Start of the validity window.
    pub start: DateTime<Utc>,
    /// End of the validity window.
    pub expiry: DateTime<Utc>,
    /// Restricts the SAS to HTTPS if set to `https`.
    pub protocol: Option<String>,
    /// The storage service version used to authorize requests made with this SAS.
    pub version: String,
}

impl BlobSas {
    /// Builds the string-to-sign for service SAS versions 2020-12-06 and later.
    pub fn string_to_sign(&self) -> String {
        let fields: [&str; 16] = [
            self.permissions.as_str(),
            &format_sas_time(self.start),
            &format_sas_time(self.expiry),
            &format!("/blob/{}/{}/{}", self.account, self.container, self.blob),
            "", // signed identifier
            "", // signed IP
            self.protocol.as_deref().unwrap_or_default(),
            &self.version,
            "b", // signed resource: blob
            "",  // snapshot time
            "",  // encryption scope
            "",  // rscc
            "",  // rscd
            "",  // rsce
            "",  // rscl
            "",  // rsct
        ];
        fields.join("\n")
    }

    /// Returns the SAS query parameters, including the signature.
    pub fn query_pairs(&self, key: &AccountKey) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("sv", self.version.clone()),
            ("sp", self.permissions.clone()),
            ("st", format_sas_time(self.start)),
            ("se", format_sas_time(self.expiry)),
            ("sr", "b".to_owned()),
        ];
        if let Some(ref protocol) = self.protocol {
            pairs.push(("spr", protocol.clone()));
        }
        pairs.push(("sig", key.sign(&self.string_to_sign())));
        pairs
    }

    /// Reconstructs a SAS from decoded query parameters of a request for the given blob.
    ///
    /// Returns the SAS together with the signature it was presented with.
    pub fn from_query(
        account: &str,
        container: &str,
        blob: &str,
        query: &[(String, String)],
    ) -> BackendResult<(Self, String)> {
        let param = |name: &str| {
            query
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        let required = |name: &str| {
            param(name).ok_or_else(|| BackendError::InvalidUrl {
                context: format!("missing SAS parameter `{name}`"),
            })
        };

        if required("sr")? != "b" {
            return Err(BackendError::InvalidUrl {
                context: "SAS is not scoped to a blob".into(),
            });
        }

        let sas = Self {
            account: account.to_owned(),
            container: container.to_owned(),
            blob: blob.to_owned(),
            permissions: required("sp")?.to_owned(),
            start: parse_sas_time(required("st")?)?,
            expiry: parse_sas_time(required("se")?)?,
            protocol: param("spr").map(str::to_owned),
            version: required("sv")?.to_owned(),
        };

        Ok((sas, required("sig")?.to_owned()))
    }

    /// Returns `true` if `now` lies within the validity window.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.expiry
    }
}

/// Formats a timestamp with second precision, as used in SAS parameters.
pub fn format_sas_time(time: DateTime<Utc>) -> String {
    time.format(SAS_TIME_FORMAT).to_string()
}

fn parse_sas_time(value: &str) -> BackendResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, SAS_TIME_FORMAT)
        .map(|time| time.and_utc())
        .map_err(|_| BackendError::InvalidUrl {
            context: format!("invalid SAS timestamp `{value}`"),
        })
}
