//! The service layer measures one blob lifecycle against a storage backend.
//!
//! A [`TestRunner`] drives a strictly ordered pipeline for a single run:
//!
//! 1. generate a random payload ([`payload`]),
//! 2. upload it under a fresh [`TestId`],
//! 3. issue a delegated, time-boxed read URL for the uploaded blob,
//! 4. download the blob anonymously through that URL,
//! 5. verify the downloaded bytes against the payload digest ([`verify`]),
//! 6. delete the blob, whatever happened before,
//! 7. report a [`RunRecord`] with the timings of every step ([`metrics`]).
//!
//! Backends implement [`StorageBackend`](backend::StorageBackend). The crate ships an
//! in-memory backend for tests and local dry runs, and an Azure Blob Storage backend
//! that talks to the REST API directly.
//!
//! Runs share nothing in-process. Many runners can target the same container
//! concurrently, because every run owns exactly one blob named after its [`TestId`].
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod backend;
pub mod error;
pub mod id;
pub mod metrics;
pub mod outcome;
pub mod payload;
pub mod retry;
pub mod runner;
pub mod verify;

pub use backend::{BoxedBackend, StorageConfig, create_backend};
pub use error::{CleanupError, RunError};
pub use id::TestId;
pub use metrics::RunRecord;
pub use outcome::Outcome;
pub use runner::{RunReport, RunnerConfig, TestRunner};
