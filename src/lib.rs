//! Scan capture orchestration for the Bloom plant-imaging station.
//!
//! The crate drives a hardware backend subprocess that owns the camera and
//! turntable, speaking a line-delimited protocol over its stdio. Callers
//! submit one scan at a time to the [`orchestrator`] actor, observe progress
//! through the [`events`] dispatcher, and get each completed scan persisted
//! exactly once by the [`storage`] writer.
//!
//! Module map:
//! - [`transport`]: subprocess lifetime and the raw line stream
//! - [`protocol`]: the `STATUS:`/`DATA:`/`ERROR:` wire codec
//! - [`orchestrator`]: the single-session capture state machine
//! - [`events`]: token-based progress/terminal event dispatch
//! - [`storage`]: durable scan records with an idempotence ledger
//! - [`scan`]: request, session, and completed-scan data model
//! - [`metadata`]: experiment/phenotyper lookups backing request validation

pub mod config;
pub mod error;
pub mod events;
pub mod messages;
pub mod metadata;
pub mod orchestrator;
pub mod protocol;
pub mod scan;
pub mod storage;
pub mod transport;

pub use config::Settings;
pub use error::{ScanError, ScanResult};
pub use orchestrator::{OrchestratorHandle, ScanOrchestrator};
