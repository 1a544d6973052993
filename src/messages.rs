//! Message types for the orchestrator actor.
//!
//! The UI (or CLI) talks to the capture state machine exclusively through
//! these commands, delivered over an `mpsc` channel with a `oneshot`
//! response per command. No shared mutable state crosses the boundary.

use crate::error::ScanError;
use crate::scan::{ScanPhase, ScanRequest};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Commands accepted by the orchestrator actor.
#[derive(Debug)]
pub enum OrchestratorCommand {
    /// Begin a scan. Rejected with `ScanAlreadyActive` when a session exists.
    StartScan {
        request: ScanRequest,
        response: oneshot::Sender<Result<Uuid, ScanError>>,
    },

    /// Request cooperative cancellation of the active scan. A no-op when no
    /// scan is active or the terminal event already arrived.
    CancelScan {
        response: oneshot::Sender<Result<(), ScanError>>,
    },

    /// Current lifecycle phase (`Idle` when no session exists).
    GetPhase {
        response: oneshot::Sender<ScanPhase>,
    },

    /// Stop the actor, killing any live subprocess.
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

impl OrchestratorCommand {
    /// Helper to create a StartScan command.
    pub fn start_scan(
        request: ScanRequest,
    ) -> (Self, oneshot::Receiver<Result<Uuid, ScanError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::StartScan {
                request,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a CancelScan command.
    pub fn cancel_scan() -> (Self, oneshot::Receiver<Result<(), ScanError>>) {
        let (tx, rx) = oneshot::channel();
        (Self::CancelScan { response: tx }, rx)
    }

    /// Helper to create a GetPhase command.
    pub fn get_phase() -> (Self, oneshot::Receiver<ScanPhase>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetPhase { response: tx }, rx)
    }

    /// Helper to create a Shutdown command.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_helpers_wire_the_response_channel() {
        let (cmd, rx) = OrchestratorCommand::get_phase();
        let OrchestratorCommand::GetPhase { response } = cmd else {
            panic!("expected GetPhase");
        };
        response.send(ScanPhase::Idle).expect("receiver alive");
        assert_eq!(tokio_test::block_on(rx).expect("response"), ScanPhase::Idle);
    }

    #[test]
    fn test_dropping_the_command_closes_the_response() {
        let (cmd, rx) = OrchestratorCommand::cancel_scan();
        drop(cmd);
        assert!(tokio_test::block_on(rx).is_err());
    }
}
