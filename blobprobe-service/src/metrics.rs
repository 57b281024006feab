//! Timestamps, derived step durations, and the run record.
//!
//! The [`MetricsRecorder`] samples a monotonic clock at every step boundary of a run.
//! Durations are derived from these checkpoints only when the run finishes, which
//! keeps the recorder out of the measured code paths.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::id::TestId;
use crate::outcome::Outcome;

/// A step boundary of a run, in pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Checkpoint {
    /// The payload has been generated.
    Generated,
    /// The upload has completed.
    UploadDone,
    /// The delegated read URL has been issued.
    SasDone,
    /// The download has completed.
    DownloadDone,
    /// The downloaded bytes have been verified.
    VerifyDone,
    /// The blob has been deleted, or deletion was given up.
    CleanupDone,
}

impl Checkpoint {
    const COUNT: usize = 6;

    /// Checkpoints that belong to the measurement, i.e. everything before cleanup.
    const MEASUREMENT: [Self; 5] = [
        Self::Generated,
        Self::UploadDone,
        Self::SasDone,
        Self::DownloadDone,
        Self::VerifyDone,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Collects checkpoints of a single run.
#[derive(Debug)]
pub struct MetricsRecorder {
    test_id: TestId,
    start_time: DateTime<Utc>,
    start: Instant,
    checkpoints: [Option<Instant>; Checkpoint::COUNT],
    payload_size: u64,
}

impl MetricsRecorder {
    /// Starts recording a run. This captures the `start` checkpoint.
    pub fn start(test_id: TestId) -> Self {
        Self {
            test_id,
            start_time: Utc::now(),
            start: Instant::now(),
            checkpoints: [None; Checkpoint::COUNT],
            payload_size: 0,
        }
    }

    /// The identifier of the recorded run.
    pub fn test_id(&self) -> &TestId {
        &self.test_id
    }

    /// Records that `checkpoint` has been reached now.
    pub fn mark(&mut self, checkpoint: Checkpoint) {
        self.mark_at(checkpoint, Instant::now());
    }

    fn mark_at(&mut self, checkpoint: Checkpoint, instant: Instant) {
        self.checkpoints[checkpoint.index()] = Some(instant);
    }

    /// Records the size of the generated payload.
    pub fn set_payload_size(&mut self, bytes: u64) {
        self.payload_size = bytes;
    }

    fn at(&self, checkpoint: Checkpoint) -> Option<Instant> {
        self.checkpoints[checkpoint.index()]
    }

    /// The latest checkpoint of the measurement that was reached, if any.
    fn last_measurement(&self) -> Option<Instant> {
        Checkpoint::MEASUREMENT
            .iter()
            .rev()
            .find_map(|checkpoint| self.at(*checkpoint))
    }

    fn between(from: Option<Instant>, to: Option<Instant>) -> Option<f64> {
        Some(millis(to?.saturating_duration_since(from?)))
    }

    /// Milliseconds between two checkpoints, `None` unless both were reached.
    pub fn elapsed_ms(&self, from: Checkpoint, to: Checkpoint) -> Option<f64> {
        Self::between(self.at(from), self.at(to))
    }

    /// Derives all durations and completes the record of this run.
    pub fn finish(self, summary: RunSummary<'_>) -> RunRecord {
        use Checkpoint::*;

        let last_measurement = self.last_measurement();

        RunRecord {
            file_size_mb: round2(self.payload_size as f64 / 1024.0 / 1024.0),
            file_size_bytes: self.payload_size,
            upload_time_ms: self.elapsed_ms(Generated, UploadDone),
            sas_generation_time_ms: self.elapsed_ms(UploadDone, SasDone),
            download_time_ms: self.elapsed_ms(SasDone, DownloadDone),
            total_time_ms: Self::between(Some(self.start), last_measurement),
            upload_to_download_time_ms: self.elapsed_ms(Generated, DownloadDone),
            cleanup_time_ms: Self::between(last_measurement, self.at(CleanupDone)),
            outcome: summary.outcome,
            error: summary.error,
            cleanup_failed: summary.cleanup_failed,
            backend: summary.backend.to_owned(),
            container: summary.container.to_owned(),
            test_id: self.test_id,
            start_time: self.start_time,
        }
    }
}

/// Everything about a finished run that is not a timestamp.
#[derive(Debug)]
pub struct RunSummary<'a> {
    /// The terminal outcome.
    pub outcome: Outcome,
    /// A description of the failure, if the run failed.
    pub error: Option<String>,
    /// Whether deleting the blob failed.
    pub cleanup_failed: bool,
    /// The name of the storage backend.
    pub backend: &'a str,
    /// The container that held the blob.
    pub container: &'a str,
}

fn millis(duration: std::time::Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// The machine-readable result of one run.
///
/// Durations are milliseconds. A duration is `null` if its step was never reached.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunRecord {
    /// The run identifier, equal to the blob name.
    pub test_id: TestId,
    /// Wall clock time at which the run started.
    pub start_time: DateTime<Utc>,
    /// Payload size in MiB, rounded to two decimals.
    pub file_size_mb: f64,
    /// Exact payload size in bytes.
    pub file_size_bytes: u64,
    /// Duration of the upload.
    pub upload_time_ms: Option<f64>,
    /// Duration of issuing the delegated read URL.
    pub sas_generation_time_ms: Option<f64>,
    /// Duration of the download.
    pub download_time_ms: Option<f64>,
    /// Duration from start of the run to the last measured step, excluding cleanup.
    pub total_time_ms: Option<f64>,
    /// Duration from the start of the upload to the end of the download.
    pub upload_to_download_time_ms: Option<f64>,
    /// Duration of the cleanup.
    pub cleanup_time_ms: Option<f64>,
    /// The terminal outcome.
    pub outcome: Outcome,
    /// A description of the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether deleting the blob failed.
    pub cleanup_failed: bool,
    /// The storage backend name.
    pub backend: String,
    /// The container that held the blob.
    pub container: String,
}

impl RunRecord {
    /// Renders the record as a single line of JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Logs a human-readable summary of the record.
    pub fn log_summary(&self) {
        fn show(value: Option<f64>) -> String {
            match value {
                Some(ms) => format!("{ms:.2} ms"),
                None => "n/a".to_owned(),
            }
        }

        let rule = "=".repeat(50);
        tracing::info!("Performance Test Results:");
        tracing::info!("{rule}");
        tracing::info!("Test ID: {}", self.test_id);
        tracing::info!("Outcome: {}", self.outcome);
        tracing::info!("File Size: {} MB", self.file_size_mb);
        tracing::info!("Upload Time: {}", show(self.upload_time_ms));
        tracing::info!("SAS Generation Time: {}", show(self.sas_generation_time_ms));
        tracing::info!("Download Time: {}", show(self.download_time_ms));
        tracing::info!("Total Time: {}", show(self.total_time_ms));
        tracing::info!(
            "Upload to Download Time: {}",
            show(self.upload_to_download_time_ms)
        );
        tracing::info!("Cleanup Time: {}", show(self.cleanup_time_ms));
        tracing::info!("{rule}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn summary(outcome: Outcome) -> RunSummary<'static> {
        RunSummary {
            outcome,
            error: None,
            cleanup_failed: false,
            backend: "memory",
            container: "performance-test",
        }
    }

    fn recorder_with(steps: &[(Checkpoint, u64)]) -> MetricsRecorder {
        let mut recorder = MetricsRecorder::start(TestId::generate());
        let start = recorder.start;
        for (checkpoint, offset_ms) in steps {
            recorder.mark_at(*checkpoint, start + Duration::from_millis(*offset_ms));
        }
        recorder
    }

    #[test]
    fn derives_durations() {
        use Checkpoint::*;

        let mut recorder = recorder_with(&[
            (Generated, 10),
            (UploadDone, 110),
            (SasDone, 112),
            (DownloadDone, 212),
            (VerifyDone, 215),
            (CleanupDone, 265),
        ]);
        recorder.set_payload_size(2 * 1024 * 1024);

        let record = recorder.finish(summary(Outcome::Success));
        assert_eq!(record.upload_time_ms, Some(100.0));
        assert_eq!(record.sas_generation_time_ms, Some(2.0));
        assert_eq!(record.download_time_ms, Some(100.0));
        assert_eq!(record.upload_to_download_time_ms, Some(202.0));
        assert_eq!(record.total_time_ms, Some(215.0));
        assert_eq!(record.cleanup_time_ms, Some(50.0));
        assert_eq!(record.file_size_mb, 2.0);
        assert_eq!(record.file_size_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn unreached_steps_are_null() {
        use Checkpoint::*;

        let recorder = recorder_with(&[(Generated, 5), (UploadDone, 50), (CleanupDone, 60)]);
        let record = recorder.finish(RunSummary {
            error: Some("issuing delegated read URL failed".into()),
            ..summary(Outcome::SasFailed)
        });

        assert_eq!(record.upload_time_ms, Some(45.0));
        assert_eq!(record.sas_generation_time_ms, None);
        assert_eq!(record.download_time_ms, None);
        assert_eq!(record.upload_to_download_time_ms, None);
        assert_eq!(record.total_time_ms, Some(50.0));
        assert_eq!(record.cleanup_time_ms, Some(10.0));

        let json: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        assert!(json["download_time_ms"].is_null());
        assert_eq!(json["outcome"], "sas_failed");
        assert_eq!(json["error"], "issuing delegated read URL failed");
    }

    #[test]
    fn rounds_size_to_two_decimals() {
        let mut recorder = recorder_with(&[]);
        recorder.set_payload_size(1_234_567);

        let record = recorder.finish(summary(Outcome::Success));
        assert_eq!(record.file_size_mb, 1.18);
    }

    #[test]
    fn json_contains_required_fields() {
        use Checkpoint::*;

        let recorder = recorder_with(&[
            (Generated, 1),
            (UploadDone, 2),
            (SasDone, 3),
            (DownloadDone, 4),
            (VerifyDone, 5),
            (CleanupDone, 6),
        ]);
        let record = recorder.finish(summary(Outcome::Success));
        let json: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();

        for field in [
            "test_id",
            "start_time",
            "file_size_mb",
            "upload_time_ms",
            "sas_generation_time_ms",
            "download_time_ms",
            "total_time_ms",
            "upload_to_download_time_ms",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
        assert!(json.get("error").is_none());
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["cleanup_failed"], false);
    }
}
