//! Scan persistence writer.
//!
//! Converts a completed scan into durable records: a `scan.json` metadata
//! document and a `frames.csv` index, written into the scan's output
//! directory next to the captured frames. Both files go through a temp-file
//! rename, and `scan.json` is renamed last so its presence marks a committed
//! record; a crash mid-write leaves no half-visible scan.
//!
//! The writer is idempotent per session: persisting the same session id a
//! second time returns the originally produced record id without touching
//! the filesystem again. The state machine is the sole caller and invokes
//! it exactly once per completed session; the guard exists for the
//! should-be-unreachable double call.

use crate::error::PersistError;
use crate::scan::{CompletedScan, FrameRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Identifier of a persisted scan record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersistedScanId(Uuid);

impl fmt::Display for PersistedScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Durable storage for completed scans.
#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Writes the scan as a single atomic unit. Safe to call again with the
    /// same session id: the second call returns the original id.
    async fn persist(&self, scan: &CompletedScan) -> Result<PersistedScanId, PersistError>;
}

/// On-disk representation of `scan.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ScanDocument {
    record_id: Uuid,
    session_id: Uuid,
    #[serde(flatten)]
    scan: ScanMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ScanMetadata {
    experiment_id: String,
    phenotyper_id: String,
    plant_barcode: String,
    accession_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wave_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plant_age_days: Option<u32>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    frames_captured: u32,
}

/// Filesystem-backed scan store.
#[derive(Default)]
pub struct FsScanStore {
    // Idempotence ledger for this process; the on-disk scan.json covers
    // restarts.
    ledger: Mutex<HashMap<Uuid, PersistedScanId>>,
}

impl FsScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger_get(&self, session_id: Uuid) -> Option<PersistedScanId> {
        match self.ledger.lock() {
            Ok(guard) => guard.get(&session_id).copied(),
            Err(poisoned) => poisoned.into_inner().get(&session_id).copied(),
        }
    }

    fn ledger_put(&self, session_id: Uuid, record_id: PersistedScanId) {
        match self.ledger.lock() {
            Ok(mut guard) => {
                guard.insert(session_id, record_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(session_id, record_id);
            }
        }
    }
}

#[async_trait]
impl ScanStore for FsScanStore {
    async fn persist(&self, scan: &CompletedScan) -> Result<PersistedScanId, PersistError> {
        if let Some(existing) = self.ledger_get(scan.session_id) {
            debug!(
                "persist called again for session {}; returning record {existing}",
                scan.session_id
            );
            return Ok(existing);
        }

        let dir = &scan.output_dir;
        let document_path = dir.join("scan.json");

        // A committed record may already exist from a previous process run.
        if document_path.exists() {
            let existing = read_document(&document_path)?;
            if existing.session_id == scan.session_id {
                self.ledger_put(scan.session_id, PersistedScanId(existing.record_id));
                return Ok(PersistedScanId(existing.record_id));
            }
            return Err(PersistError::Conflict(dir.clone()));
        }

        fs::create_dir_all(dir).map_err(|source| PersistError::Write {
            path: dir.clone(),
            source,
        })?;

        write_frame_index(dir, &scan.frames)?;

        let record_id = Uuid::new_v4();
        let document = ScanDocument {
            record_id,
            session_id: scan.session_id,
            scan: ScanMetadata {
                experiment_id: scan.request.experiment_id.clone(),
                phenotyper_id: scan.request.phenotyper_id.clone(),
                plant_barcode: scan.request.plant_barcode.clone(),
                accession_name: scan.request.accession_name.clone(),
                wave_number: scan.request.wave_number,
                plant_age_days: scan.request.plant_age_days,
                started_at: scan.started_at,
                finished_at: scan.finished_at,
                frames_captured: scan.frames.len() as u32,
            },
        };
        write_document(&document_path, &document)?;

        info!(
            "persisted scan {} ({} frames) to {}",
            record_id,
            scan.frames.len(),
            dir.display()
        );
        let id = PersistedScanId(record_id);
        self.ledger_put(scan.session_id, id);
        Ok(id)
    }
}

fn read_document(path: &Path) -> Result<ScanDocument, PersistError> {
    let bytes = fs::read(path).map_err(|source| PersistError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_document(path: &Path, document: &ScanDocument) -> Result<(), PersistError> {
    let tmp = tmp_path(path);
    let bytes = serde_json::to_vec_pretty(document)?;
    fs::write(&tmp, bytes).map_err(|source| PersistError::Write {
        path: tmp.clone(),
        source,
    })?;
    // Rename is the commit point.
    fs::rename(&tmp, path).map_err(|source| PersistError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn write_frame_index(dir: &Path, frames: &[FrameRecord]) -> Result<(), PersistError> {
    let final_path = dir.join("frames.csv");
    let tmp = tmp_path(&final_path);
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        for frame in frames {
            writer.serialize(frame)?;
        }
        writer.flush().map_err(|source| PersistError::Write {
            path: tmp.clone(),
            source,
        })?;
    }
    fs::rename(&tmp, &final_path).map_err(|source| PersistError::Write {
        path: final_path,
        source,
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
