//! The state machine driving a single run.
//!
//! A run moves strictly forward through
//! `Init → GenerateImage → Upload → IssueSas → Download → Verify → Cleanup → Report`.
//! A failure in any measured step skips the remaining measured steps, but never
//! cleanup: once a blob may exist, it is deleted exactly once before the report.

use std::num::NonZeroU64;
use std::time::Duration;

use crate::backend::{BackendError, BackendResult, BlobReference, BoxedBackend};
use crate::error::{CleanupError, RunError, error_chain};
use crate::id::TestId;
use crate::metrics::{Checkpoint, MetricsRecorder, RunRecord, RunSummary};
use crate::outcome::Outcome;
use crate::payload::{DEFAULT_MAX_SIZE, PayloadGenerator};
use crate::retry::RetryPolicy;
use crate::verify::verify;

/// Parameters of a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunnerConfig {
    /// Upper bound for the random payload size.
    pub max_payload_size: NonZeroU64,
    /// Validity of the delegated read URL.
    pub sas_ttl: Duration,
    /// Bound for every single backend call.
    pub request_timeout: Duration,
    /// Retries of transient upload and download failures.
    pub retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_SIZE,
            sas_ttl: Duration::from_secs(60 * 60),
            request_timeout: Duration::from_secs(60),
            retry: RetryPolicy::none(),
        }
    }
}

/// Executes runs against a single backend.
///
/// Every call to [`run`](Self::run) is an independent run with its own [`TestId`] and
/// blob. Runners share no state besides the backend, so any number of them can target
/// the same container at once.
#[derive(Debug)]
pub struct TestRunner {
    backend: BoxedBackend,
    config: RunnerConfig,
    generator: PayloadGenerator,
}

impl TestRunner {
    /// Creates a runner generating payloads of up to `config.max_payload_size` bytes.
    pub fn new(backend: BoxedBackend, config: RunnerConfig) -> Self {
        Self {
            backend,
            generator: PayloadGenerator::uniform(config.max_payload_size),
            config,
        }
    }

    /// Replaces the payload generator.
    pub fn with_generator(mut self, generator: PayloadGenerator) -> Self {
        self.generator = generator;
        self
    }

    /// The name of the backend runs are executed against.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Executes one complete run.
    pub async fn run(&self) -> RunReport {
        self.run_until(std::future::pending()).await
    }

    /// Executes one run, aborting the measurement once `shutdown` resolves.
    ///
    /// An aborted run still deletes its blob and is reported as
    /// [`Outcome::Interrupted`].
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> RunReport {
        let test_id = TestId::generate();
        let mut recorder = MetricsRecorder::start(test_id.clone());
        tracing::info!(
            %test_id,
            backend = self.backend.name(),
            "Starting performance test"
        );

        let mut blob = None;
        let result = tokio::select! {
            result = self.measure(&test_id, &mut recorder, &mut blob) => result,
            () = shutdown => {
                tracing::warn!(%test_id, "Shutdown requested, aborting run");
                Err(RunError::Interrupted)
            }
        };

        let cleanup_error = match blob.take() {
            Some(blob) => {
                let result = self.cleanup(blob).await;
                recorder.mark(Checkpoint::CleanupDone);
                result.err()
            }
            None => None,
        };

        let error = result.err();
        let outcome = error.as_ref().map_or(Outcome::Success, Outcome::from);
        match error {
            None => tracing::info!(%test_id, "Performance test completed successfully!"),
            Some(RunError::Interrupted) => tracing::warn!(%test_id, "Performance test interrupted"),
            // Logged when detected.
            Some(RunError::Verification(_)) => (),
            Some(ref error) => tracing::error!(
                %test_id,
                error = error as &dyn std::error::Error,
                "Performance test failed"
            ),
        }

        let record = recorder.finish(RunSummary {
            outcome,
            error: error.as_ref().map(|error| error_chain(error)),
            cleanup_failed: cleanup_error.is_some(),
            backend: self.backend.name(),
            container: self.backend.blob_reference(test_id.as_str()).container(),
        });
        record.log_summary();

        RunReport {
            record,
            error,
            cleanup_error,
        }
    }

    /// The measured steps of a run.
    ///
    /// `blob` is populated before the upload starts, since a failed or interrupted upload
    /// may still have created the blob.
    async fn measure(
        &self,
        test_id: &TestId,
        recorder: &mut MetricsRecorder,
        blob: &mut Option<BlobReference>,
    ) -> Result<(), RunError> {
        let backend = &*self.backend;
        let timeout = self.config.request_timeout;
        let name = test_id.as_str();

        tracing::info!("Step 1: Creating random image...");
        let payload = self.generator.generate();
        let seed = payload.seed();
        let (width, height) = payload.dimensions();
        let (bytes, fingerprint) = payload.into_parts();
        recorder.set_payload_size(fingerprint.len());
        recorder.mark(Checkpoint::Generated);
        tracing::debug!(seed, %fingerprint, "Generated payload");
        tracing::info!(
            "Generated random image: {width}x{height}, {:.2} MB",
            fingerprint.len() as f64 / 1024.0 / 1024.0
        );

        tracing::info!("Step 2: Uploading to blob storage...");
        *blob = Some(backend.blob_reference(name));
        let uploaded = self
            .config
            .retry
            .run("upload", move || bounded(timeout, backend.put_blob(name, bytes.clone())))
            .await
            .map_err(RunError::Upload)?;
        recorder.mark(Checkpoint::UploadDone);
        log_step("Upload", recorder.elapsed_ms(Checkpoint::Generated, Checkpoint::UploadDone));
        *blob = Some(uploaded.clone());

        tracing::info!("Step 3: Generating SAS URL...");
        let url = bounded(timeout, backend.issue_read_url(&uploaded, self.config.sas_ttl))
            .await
            .map_err(RunError::Sas)?;
        recorder.mark(Checkpoint::SasDone);
        log_step(
            "SAS URL generation",
            recorder.elapsed_ms(Checkpoint::UploadDone, Checkpoint::SasDone),
        );

        tracing::info!("Step 4: Downloading via SAS URL...");
        url.ensure_bound_to(&uploaded).map_err(RunError::Sas)?;
        let url = &url;
        let downloaded = self
            .config
            .retry
            .run("download", move || bounded(timeout, backend.get_via_url(url)))
            .await
            .map_err(RunError::download)?;
        recorder.mark(Checkpoint::DownloadDone);
        log_step(
            "Download",
            recorder.elapsed_ms(Checkpoint::SasDone, Checkpoint::DownloadDone),
        );

        let verified = verify(&fingerprint, &downloaded);
        drop(downloaded);
        recorder.mark(Checkpoint::VerifyDone);
        if let Err(error) = verified {
            tracing::error!(
                %test_id,
                error = &error as &dyn std::error::Error,
                "Download verification failed"
            );
            return Err(error.into());
        }
        tracing::info!("Download verification successful, content matches");

        Ok(())
    }

    /// Deletes the blob of a run. Failures are logged, never propagated.
    async fn cleanup(&self, blob: BlobReference) -> Result<(), CleanupError> {
        tracing::info!("Cleaning up test blob...");
        let timeout = self.config.request_timeout;

        match bounded(timeout, self.backend.delete_blob(&blob)).await {
            Ok(()) => Ok(()),
            Err(cause) => {
                let error = CleanupError { blob, cause };
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "Failed to clean up test blob"
                );
                Err(error)
            }
        }
    }
}

/// Bounds a backend call by `timeout`.
async fn bounded<T>(
    timeout: Duration,
    operation: impl Future<Output = BackendResult<T>>,
) -> BackendResult<T> {
    tokio::time::timeout(timeout, operation)
        .await
        .unwrap_or_else(|_| Err(BackendError::Timeout(timeout)))
}

fn log_step(step: &str, elapsed_ms: Option<f64>) {
    tracing::info!("{step} completed in {:.2} ms", elapsed_ms.unwrap_or_default());
}

/// The result of a run: its record plus the errors behind it.
#[derive(Debug)]
pub struct RunReport {
    record: RunRecord,
    error: Option<RunError>,
    cleanup_error: Option<CleanupError>,
}

impl RunReport {
    /// The terminal outcome of the run.
    pub fn outcome(&self) -> Outcome {
        self.record.outcome
    }

    /// The process exit status corresponding to the outcome.
    pub fn exit_code(&self) -> u8 {
        self.outcome().exit_code()
    }

    /// The machine-readable record of the run.
    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    /// The error that ended the measurement, if any.
    pub fn error(&self) -> Option<&RunError> {
        self.error.as_ref()
    }

    /// The error of a failed cleanup, if any.
    pub fn cleanup_error(&self) -> Option<&CleanupError> {
        self.cleanup_error.as_ref()
    }

    /// Consumes the report, returning the record.
    pub fn into_record(self) -> RunRecord {
        self.record
    }
}
