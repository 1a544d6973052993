//! Scan data model: requests, sessions, and completed-scan records.
//!
//! A [`ScanRequest`] is immutable once submitted and owned exclusively by the
//! orchestrator for the duration of one scan. The orchestrator wraps it in a
//! [`ScanSession`], the single source of truth for one in-flight scan; at
//! most one session exists at any instant.

use crate::config::ScanSettings;
use crate::error::{ScanError, ScanResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Input for one rotational capture, constructed by the caller at scan start.
///
/// `wave_number` and `plant_age_days` are explicit optionals: zero is a valid
/// recorded value, distinct from absent. Callers must never collapse the two.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub experiment_id: String,
    pub phenotyper_id: String,
    /// Plant barcode scanned at the imaging station.
    pub plant_barcode: String,
    /// Accession name resolved upstream from the barcode.
    pub accession_name: String,
    /// Camera exposure in microseconds.
    pub exposure_us: u32,
    pub gain: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contrast: Option<f64>,
    pub gamma: f64,
    /// Time for one full turntable rotation, in seconds.
    pub rotation_seconds: f64,
    /// Number of frames to capture over the rotation.
    pub frames_total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wave_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plant_age_days: Option<u32>,
}

impl ScanRequest {
    /// Structural validation; metadata existence is checked separately
    /// against the metadata store.
    pub fn validate(&self) -> ScanResult<()> {
        if self.experiment_id.trim().is_empty() {
            return Err(ScanError::InvalidRequest(
                "experiment_id cannot be empty".to_string(),
            ));
        }
        if self.phenotyper_id.trim().is_empty() {
            return Err(ScanError::InvalidRequest(
                "phenotyper_id cannot be empty".to_string(),
            ));
        }
        if self.plant_barcode.trim().is_empty() {
            return Err(ScanError::InvalidRequest(
                "plant_barcode cannot be empty".to_string(),
            ));
        }
        if self.frames_total == 0 {
            return Err(ScanError::InvalidRequest(
                "frames_total must be positive".to_string(),
            ));
        }
        if self.rotation_seconds <= 0.0 {
            return Err(ScanError::InvalidRequest(format!(
                "rotation_seconds must be positive, got {}",
                self.rotation_seconds
            )));
        }
        if self.exposure_us == 0 {
            return Err(ScanError::InvalidRequest(
                "exposure_us must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// A representative request, used by tests and documentation examples.
    pub fn sample() -> Self {
        Self {
            experiment_id: "EXP-042".to_string(),
            phenotyper_id: "PH-7".to_string(),
            plant_barcode: "PLT-000123".to_string(),
            accession_name: "Col-0".to_string(),
            exposure_us: 12_000,
            gain: 1.5,
            brightness: None,
            contrast: None,
            gamma: 1.0,
            rotation_seconds: 7.2,
            frames_total: 72,
            wave_number: Some(0),
            plant_age_days: Some(14),
        }
    }
}

/// Wire parameters for the `start_scan` command: the request fields plus the
/// output directory the subprocess writes frames into.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanParams {
    #[serde(flatten)]
    pub request: ScanRequest,
    pub output_path: String,
}

impl ScanParams {
    pub fn from_request(request: &ScanRequest, output_path: impl Into<String>) -> Self {
        Self {
            request: request.clone(),
            output_path: output_path.into(),
        }
    }
}

/// Lifecycle phase of a scan session.
///
/// `Idle` is the initial phase; `Completed`, `Failed` and `Cancelled` are
/// terminal and the orchestrator returns to `Idle` immediately after
/// reaching one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanPhase {
    Idle,
    Configuring,
    Capturing,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl ScanPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanPhase::Completed | ScanPhase::Failed | ScanPhase::Cancelled
        )
    }
}

/// Runtime state for one in-progress scan. Created by `start`, destroyed
/// when the scan reaches a terminal phase.
#[derive(Debug)]
pub struct ScanSession {
    pub id: Uuid,
    pub request: ScanRequest,
    pub phase: ScanPhase,
    pub frames_captured: u32,
    pub started_at: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub cancel_requested: bool,
}

impl ScanSession {
    /// Creates a session in `Configuring` with a deterministic output
    /// directory under `scan_root`.
    pub fn new(request: ScanRequest, scan_root: &Path) -> Self {
        let started_at = Utc::now();
        let dir_name = output_dir_name(&request.experiment_id, &request.plant_barcode, started_at);
        Self {
            id: Uuid::new_v4(),
            request,
            phase: ScanPhase::Configuring,
            frames_captured: 0,
            started_at,
            output_dir: scan_root.join(dir_name),
            cancel_requested: false,
        }
    }

    /// Applies a progress report. The counter is monotonic: a stale or
    /// out-of-order report never decreases it.
    pub fn record_progress(&mut self, frames_captured: u32) -> u32 {
        self.frames_captured = self.frames_captured.max(frames_captured);
        self.frames_captured
    }

    /// Inactivity window for this scan: the expected per-frame interval with
    /// margin applied, never below the configured floor.
    pub fn inactivity_window(&self, settings: &ScanSettings) -> Duration {
        let per_frame = self.request.rotation_seconds / f64::from(self.request.frames_total.max(1));
        let window = Duration::from_secs_f64(per_frame * settings.inactivity_margin);
        window.max(settings.min_inactivity_window)
    }
}

/// One captured frame within a persisted scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// 1-based frame index in capture order.
    pub index: u32,
    pub file_name: String,
    /// Turntable position when the frame was captured.
    pub position_degrees: f64,
}

/// A finished, successful capture, ready for persistence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletedScan {
    pub session_id: Uuid,
    pub request: ScanRequest,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub frames: Vec<FrameRecord>,
}

impl CompletedScan {
    /// Builds the completed-scan record from a session that reached
    /// `Finalizing`, deriving the ordered frame list from the final counter.
    pub fn from_session(session: &ScanSession) -> Self {
        let degrees_per_frame = 360.0 / f64::from(session.request.frames_total.max(1));
        let frames = (1..=session.frames_captured)
            .map(|index| FrameRecord {
                index,
                file_name: format!("frame_{index:03}.png"),
                position_degrees: f64::from(index - 1) * degrees_per_frame,
            })
            .collect();
        Self {
            session_id: session.id,
            request: session.request.clone(),
            started_at: session.started_at,
            finished_at: Utc::now(),
            output_dir: session.output_dir.clone(),
            frames,
        }
    }
}

/// Deterministic scan directory name: experiment, plant barcode, and a
/// disambiguating timestamp, sanitised for the filesystem.
pub fn output_dir_name(experiment: &str, plant_barcode: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        sanitize(experiment),
        sanitize(plant_barcode),
        at.format("%Y%m%d-%H%M%S")
    )
}

fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}
