//! Configuration for the blobprobe CLI.
//!
//! Configuration is built once at startup and passed into the runner. It can be loaded from
//! multiple sources with the following precedence (highest to lowest):
//!
//! 1. Environment variables (prefixed with `BLOBPROBE__`)
//! 2. Azure storage environment variables (`AZURE_STORAGE_ACCOUNT_NAME` and friends)
//! 3. YAML configuration file (specified via `-c` or `--config` flag)
//! 4. Defaults
//!
//! See [`Config`] for a description of all configuration fields and their defaults.
//!
//! # Environment Variables
//!
//! Environment variables use `BLOBPROBE__` as a prefix and double underscores (`__`) to denote
//! nested configuration structures. For example:
//!
//! - `BLOBPROBE__STORAGE__TYPE=memory` runs against an in-process store
//! - `BLOBPROBE__STORAGE__CONTAINER=perf` sets the container name
//! - `BLOBPROBE__MAX_PAYLOAD_SIZE=2MiB` bounds the payload size
//!
//! For compatibility with existing pipelines, the storage account can also be configured with:
//!
//! - `AZURE_STORAGE_ACCOUNT_NAME`
//! - `AZURE_STORAGE_ACCOUNT_ENDPOINT`
//! - `AZURE_STORAGE_ACCOUNT_KEY`
//! - `AZURE_STORAGE_ACCESS_TOKEN`
//!
//! # YAML Configuration File
//!
//! ```yaml
//! storage:
//!   type: azure
//!   account: myaccount
//!   container: performance-test
//!
//! max_payload_size: 5MiB
//! sas_ttl: 1h
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::{env, fmt};
use std::num::NonZeroU64;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use blobprobe_service::backend::{AccountKey, AzureCredential, StorageConfig};
use blobprobe_service::payload::{self, PayloadGenerator};
use blobprobe_service::retry::RetryPolicy;
use blobprobe_service::RunnerConfig;
use bytesize::ByteSize;
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SecretString, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "BLOBPROBE__";

/// Azure storage variables and the configuration keys they map to.
const AZURE_ENV: [(&str, &str); 4] = [
    ("AZURE_STORAGE_ACCOUNT_NAME", "storage.account"),
    ("AZURE_STORAGE_ACCOUNT_ENDPOINT", "storage.endpoint"),
    ("AZURE_STORAGE_ACCOUNT_KEY", "storage.account_key"),
    ("AZURE_STORAGE_ACCESS_TOKEN", "storage.access_token"),
];

/// Delegated URLs carry whole seconds, shorter validities cannot be expressed.
const MIN_SAS_TTL: Duration = Duration::from_secs(1);

const DEFAULT_CONTAINER: &str = "performance-test";

fn default_container() -> String {
    DEFAULT_CONTAINER.to_owned()
}

/// Newtype around `String` that may protect against accidental
/// logging of secrets in our configuration struct. Use with
/// [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Storage backend configuration.
///
/// The `type` field in YAML or `__TYPE` in environment variables determines which variant is used.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Storage {
    /// Azure Blob Storage (type `"azure"`).
    ///
    /// # Example
    ///
    /// ```yaml
    /// storage:
    ///   type: azure
    ///   account: myaccount
    ///   account_key: <base64 key>
    /// ```
    Azure {
        /// Name of the storage account. Required.
        ///
        /// # Environment Variables
        ///
        /// - `AZURE_STORAGE_ACCOUNT_NAME`
        /// - `BLOBPROBE__STORAGE__ACCOUNT`
        account: Option<String>,

        /// Blob service endpoint.
        ///
        /// # Default
        ///
        /// `https://<account>.blob.core.windows.net`
        ///
        /// # Environment Variables
        ///
        /// - `AZURE_STORAGE_ACCOUNT_ENDPOINT`
        /// - `BLOBPROBE__STORAGE__ENDPOINT`
        endpoint: Option<String>,

        /// Base64 account key. Required to sign delegated read URLs.
        ///
        /// # Environment Variables
        ///
        /// - `AZURE_STORAGE_ACCOUNT_KEY`
        /// - `BLOBPROBE__STORAGE__ACCOUNT_KEY`
        account_key: Option<SecretBox<ConfigSecret>>,

        /// Short-lived OAuth access token, used if no account key is configured.
        ///
        /// A token authorizes uploads and deletes, but cannot sign delegated read URLs. Runs
        /// with a token only are therefore reported as `sas_failed`.
        ///
        /// # Environment Variables
        ///
        /// - `AZURE_STORAGE_ACCESS_TOKEN`
        /// - `BLOBPROBE__STORAGE__ACCESS_TOKEN`
        access_token: Option<SecretBox<ConfigSecret>>,

        /// Container holding the test blobs. It must exist.
        ///
        /// # Default
        ///
        /// `"performance-test"`
        #[serde(default = "default_container")]
        container: String,
    },

    /// In-process storage for dry runs (type `"memory"`).
    ///
    /// Nothing leaves the process. Useful to check configuration and output plumbing.
    Memory {
        /// Container name reported in the run record.
        #[serde(default = "default_container")]
        container: String,
    },
}

impl Storage {
    /// The container holding the test blobs.
    pub fn container(&self) -> &str {
        match self {
            Storage::Azure { container, .. } | Storage::Memory { container } => container,
        }
    }
}

/// Retries of transient upload and download failures.
///
/// Runs are measured without retries by default.
#[derive(Debug, Deserialize, Serialize)]
pub struct Retry {
    /// Total number of attempts per step, including the first.
    ///
    /// # Default
    ///
    /// `1` (no retries)
    ///
    /// # Environment Variable
    ///
    /// `BLOBPROBE__RETRY__MAX_ATTEMPTS`
    pub max_attempts: u32,

    /// Delay before the first retry.
    ///
    /// # Default
    ///
    /// `500ms`
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Growth factor of the delay for each further retry.
    ///
    /// # Default
    ///
    /// `2.0`
    pub multiplier: f64,
}

impl Default for Retry {
    fn default() -> Self {
        let policy = RetryPolicy::none();
        Self {
            max_attempts: policy.max_attempts,
            base_delay: policy.base_delay,
            multiplier: policy.multiplier,
        }
    }
}

/// [Sentry](https://sentry.io/) error reporting configuration.
///
/// Sentry is disabled by default and only enabled when a DSN is provided. Failed runs are
/// reported as error events.
#[derive(Debug, Deserialize, Serialize)]
pub struct Sentry {
    /// Sentry DSN (Data Source Name).
    ///
    /// # Environment Variable
    ///
    /// `BLOBPROBE__SENTRY__DSN`
    pub dsn: Option<SecretBox<ConfigSecret>>,

    /// Environment name, such as the CI pipeline.
    ///
    /// # Environment Variable
    ///
    /// `BLOBPROBE__SENTRY__ENVIRONMENT`
    pub environment: Option<Cow<'static, str>>,

    /// Instance name, such as the CI job.
    ///
    /// # Environment Variable
    ///
    /// `BLOBPROBE__SENTRY__SERVER_NAME`
    pub server_name: Option<Cow<'static, str>>,

    /// Error event sampling rate between `0.0` and `1.0`.
    ///
    /// # Default
    ///
    /// `1.0` (send all errors)
    pub sample_rate: f32,

    /// Enable Sentry SDK debug mode.
    pub debug: bool,

    /// Additional tags to attach to all Sentry events.
    ///
    /// # Environment Variables
    ///
    /// Each tag is set individually, e.g. `BLOBPROBE__SENTRY__TAGS__REGION=westeurope`.
    pub tags: BTreeMap<String, String>,
}

impl Sentry {
    /// Returns whether Sentry integration is enabled.
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            server_name: None,
            sample_rate: 1.0,
            debug: false,
            tags: BTreeMap::new(),
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2025-10-17T12:10:32.123456Z  INFO blobprobe_service::runner: Step 2: Uploading to blob storage...
    /// ```
    Simplified,

    /// Dump out JSON lines.
    Json,
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr. Stdout is reserved for the run record.
#[derive(Debug, Deserialize, Serialize)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// The `RUST_LOG` environment variable provides more granular control per module if needed.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `BLOBPROBE__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format. See [`LogFormat`] for available options.
    ///
    /// # Default
    ///
    /// `Auto`
    ///
    /// # Environment Variable
    ///
    /// `BLOBPROBE__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct for a blobprobe run.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// The storage backend to measure.
    ///
    /// # Default
    ///
    /// Azure, with the account taken from `AZURE_STORAGE_ACCOUNT_NAME`.
    pub storage: Storage,

    /// Upper bound for the size of the random image, between 58 bytes and 1 GiB.
    ///
    /// # Default
    ///
    /// `5MiB`
    ///
    /// # Environment Variable
    ///
    /// `BLOBPROBE__MAX_PAYLOAD_SIZE`
    pub max_payload_size: ByteSize,

    /// Fixed image size, overriding the random size if set. The image fills it up to a
    /// partial row of pixels.
    ///
    /// # Environment Variable
    ///
    /// `BLOBPROBE__PAYLOAD_SIZE`
    pub payload_size: Option<ByteSize>,

    /// Validity of the delegated read URL.
    ///
    /// # Default
    ///
    /// `1h`
    ///
    /// # Environment Variable
    ///
    /// `BLOBPROBE__SAS_TTL`
    #[serde(with = "humantime_serde")]
    pub sas_ttl: Duration,

    /// Bound for every single storage request.
    ///
    /// # Default
    ///
    /// `60s`
    ///
    /// # Environment Variable
    ///
    /// `BLOBPROBE__REQUEST_TIMEOUT`
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Retries of transient failures. Disabled by default.
    pub retry: Retry,

    /// Logging configuration.
    pub logging: Logging,

    /// Sentry configuration.
    pub sentry: Sentry,
}

impl Default for Config {
    fn default() -> Self {
        let runner = RunnerConfig::default();

        Self {
            storage: Storage::Azure {
                account: None,
                endpoint: None,
                account_key: None,
                access_token: None,
                container: default_container(),
            },
            max_payload_size: ByteSize::b(runner.max_payload_size.get()),
            payload_size: None,
            sas_ttl: runner.sas_ttl,
            request_timeout: runner.request_timeout,
            retry: Retry::default(),
            logging: Logging::default(),
            sentry: Sentry::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided)
    /// 3. Azure storage environment variables
    /// 4. Environment variables (prefixed with `BLOBPROBE__`)
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The YAML configuration file cannot be read or parsed
    /// - Environment variables contain invalid values
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }

        // Merged verbatim, since account names may consist of digits only.
        for (var, key) in AZURE_ENV {
            if let Some(value) = env::var(var).ok().filter(|value| !value.is_empty()) {
                figment = figment.merge(Serialized::default(key, value));
            }
        }

        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Checks the configuration for values that would make a run meaningless.
    ///
    /// A missing storage account is reported here, before any storage request is made.
    pub fn validate(&self) -> Result<()> {
        if let Storage::Azure {
            account,
            account_key,
            access_token,
            ..
        } = &self.storage
        {
            if account.as_deref().is_none_or(str::is_empty) {
                bail!("AZURE_STORAGE_ACCOUNT_NAME environment variable is required");
            }
            if account_key.is_none() && access_token.is_none() {
                bail!(
                    "either AZURE_STORAGE_ACCOUNT_KEY or AZURE_STORAGE_ACCESS_TOKEN is required"
                );
            }
        }

        if self.storage.container().is_empty() {
            bail!("storage container must not be empty");
        }
        if self.sas_ttl < MIN_SAS_TTL {
            bail!("sas_ttl must be at least {MIN_SAS_TTL:?}");
        }
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be positive");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if !(self.retry.multiplier >= 1.0) {
            bail!("retry.multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.sentry.sample_rate) {
            bail!("sentry.sample_rate must be between 0.0 and 1.0");
        }

        self.payload_generator()?;
        self.storage_config()?;

        Ok(())
    }

    /// Returns the backend configuration.
    pub fn storage_config(&self) -> Result<StorageConfig<'_>> {
        Ok(match &self.storage {
            Storage::Azure {
                account,
                endpoint,
                account_key,
                access_token,
                container,
            } => {
                let account = account
                    .as_deref()
                    .context("AZURE_STORAGE_ACCOUNT_NAME environment variable is required")?;

                let credential = match (account_key, access_token) {
                    (Some(key), _) => AzureCredential::SharedKey(
                        AccountKey::from_base64(key.expose_secret().as_str())
                            .context("invalid storage account key")?,
                    ),
                    (None, Some(token)) => AzureCredential::BearerToken(SecretString::from(
                        token.expose_secret().as_str(),
                    )),
                    (None, None) => bail!("no storage credentials configured"),
                };

                StorageConfig::Azure {
                    account,
                    endpoint: endpoint.as_deref(),
                    container,
                    credential,
                    request_timeout: self.request_timeout,
                }
            }
            Storage::Memory { container } => StorageConfig::Memory { container },
        })
    }

    /// Returns the parameters of the run.
    pub fn runner_config(&self) -> Result<RunnerConfig> {
        let max_payload_size = payload_size("max_payload_size", self.max_payload_size)?;

        Ok(RunnerConfig {
            max_payload_size,
            sas_ttl: self.sas_ttl,
            request_timeout: self.request_timeout,
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: self.retry.base_delay,
                multiplier: self.retry.multiplier,
            },
        })
    }

    /// Returns the payload generator for the configured sizes.
    pub fn payload_generator(&self) -> Result<PayloadGenerator> {
        let max_size = self.runner_config()?.max_payload_size;

        Ok(match self.payload_size {
            Some(size) => PayloadGenerator::fixed(payload_size("payload_size", size)?),
            None => PayloadGenerator::uniform(max_size),
        })
    }
}

/// Checks that images of `size` can be generated.
fn payload_size(name: &str, size: ByteSize) -> Result<NonZeroU64> {
    match NonZeroU64::new(size.as_u64()) {
        Some(size) if (payload::MIN_SIZE..=payload::MAX_SIZE).contains(&size) => Ok(size),
        _ => bail!(
            "{name} must be between {} and {}",
            ByteSize::b(payload::MIN_SIZE.get()),
            ByteSize::b(payload::MAX_SIZE.get())
        ),
    }
}
