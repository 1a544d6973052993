//! Capture state machine.
//!
//! The orchestrator is an actor: all mutable scan state lives in a single
//! async task that processes [`OrchestratorCommand`]s via message-passing,
//! so no lock is ever shared with the caller. The event loop multiplexes
//! three sources with `tokio::select!`: caller commands, transport events
//! from the hardware subprocess, and the inactivity deadline.
//!
//! Lifecycle: `Idle → Configuring → Capturing → Finalizing → {Completed |
//! Failed | Cancelled}`, with every terminal phase returning the actor to
//! `Idle` for the next request. At most one session exists at any instant;
//! a second start is rejected, never queued. "Scan in progress" is a single
//! `Capturing` phase — the event dispatcher carries the per-frame counter,
//! keeping the machine small.
//!
//! Guarantees upheld here:
//! - the persistence writer is invoked exactly once, on the
//!   `Finalizing → Completed` transition;
//! - each session produces exactly one terminal event (`complete`,
//!   `error`, or `cancelled`), with all its progress events before it;
//! - cancellation is cooperative toward the hardware but authoritative
//!   toward the application: after the grace period the subprocess is
//!   killed and the session is `Cancelled` regardless.

use crate::config::Settings;
use crate::error::{ScanError, ScanResult};
use crate::events::{EventDispatcher, EventKind, ScanEvent, SubscriptionToken};
use crate::messages::OrchestratorCommand;
use crate::metadata::MetadataStore;
use crate::protocol::{decode_line, HardwareAvailability, HardwareMessage, ScanOutcome};
use crate::scan::{CompletedScan, ScanParams, ScanPhase, ScanRequest, ScanSession};
use crate::storage::ScanStore;
use crate::transport::{Transport, TransportEvent, TransportFactory};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Caller-side handle to a running orchestrator actor.
pub struct OrchestratorHandle {
    command_tx: mpsc::Sender<OrchestratorCommand>,
    dispatcher: Arc<EventDispatcher>,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Submits a scan request. Returns the session id on acceptance.
    pub async fn start_scan(&self, request: ScanRequest) -> ScanResult<Uuid> {
        let (cmd, rx) = OrchestratorCommand::start_scan(request);
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| ScanError::OrchestratorStopped)?;
        rx.await.map_err(|_| ScanError::OrchestratorStopped)?
    }

    /// Requests cooperative cancellation of the active scan. A no-op when no
    /// scan is active.
    pub async fn cancel(&self) -> ScanResult<()> {
        let (cmd, rx) = OrchestratorCommand::cancel_scan();
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| ScanError::OrchestratorStopped)?;
        rx.await.map_err(|_| ScanError::OrchestratorStopped)?
    }

    /// Current lifecycle phase (`Idle` when no scan is active).
    pub async fn phase(&self) -> ScanResult<ScanPhase> {
        let (cmd, rx) = OrchestratorCommand::get_phase();
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| ScanError::OrchestratorStopped)?;
        rx.await.map_err(|_| ScanError::OrchestratorStopped)
    }

    /// Registers an event listener. The caller must `off()` the returned
    /// token when its own lifetime ends.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionToken
    where
        F: Fn(&ScanEvent) + Send + Sync + 'static,
    {
        self.dispatcher.on(kind, handler)
    }

    /// Revokes a previously registered listener.
    pub fn off(&self, token: SubscriptionToken) {
        self.dispatcher.off(token);
    }

    /// Shared dispatcher, for callers that manage subscriptions themselves.
    pub fn dispatcher(&self) -> Arc<EventDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Stops the actor, killing any live subprocess, and waits for it.
    pub async fn shutdown(self) {
        let (cmd, rx) = OrchestratorCommand::shutdown();
        if self.command_tx.send(cmd).await.is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = self.task.await {
            warn!("orchestrator task ended abnormally: {e}");
        }
    }
}

/// The actor that owns all scan state.
pub struct ScanOrchestrator {
    settings: Settings,
    factory: Box<dyn TransportFactory>,
    transport: Option<Box<dyn Transport>>,
    store: Arc<dyn ScanStore>,
    metadata: Arc<dyn MetadataStore>,
    dispatcher: Arc<EventDispatcher>,
    session: Option<ScanSession>,
    deadline: Option<Instant>,
}

impl ScanOrchestrator {
    /// Spawns the actor and returns the caller handle.
    pub fn spawn(
        settings: Settings,
        factory: Box<dyn TransportFactory>,
        store: Arc<dyn ScanStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> OrchestratorHandle {
        let dispatcher = Arc::new(EventDispatcher::new());
        let (command_tx, command_rx) = mpsc::channel(32);
        let actor = Self {
            settings,
            factory,
            transport: None,
            store,
            metadata,
            dispatcher: Arc::clone(&dispatcher),
            session: None,
            deadline: None,
        };
        let task = tokio::spawn(actor.run(command_rx));
        OrchestratorHandle {
            command_tx,
            dispatcher,
            task,
        }
    }

    /// Actor event loop. Exits when the command channel closes or a
    /// Shutdown command arrives.
    async fn run(mut self, mut command_rx: mpsc::Receiver<OrchestratorCommand>) {
        info!("scan orchestrator started");
        let mut events: Option<mpsc::Receiver<TransportEvent>> = None;

        loop {
            let deadline = self.deadline;
            tokio::select! {
                maybe_cmd = command_rx.recv() => match maybe_cmd {
                    None => {
                        self.stop_transport().await;
                        break;
                    }
                    Some(OrchestratorCommand::StartScan { request, response }) => {
                        let result = self.begin_scan(request, &mut events).await;
                        let _ = response.send(result);
                    }
                    Some(OrchestratorCommand::CancelScan { response }) => {
                        let result = self.request_cancel().await;
                        let _ = response.send(result);
                    }
                    Some(OrchestratorCommand::GetPhase { response }) => {
                        let phase = self
                            .session
                            .as_ref()
                            .map_or(ScanPhase::Idle, |s| s.phase);
                        let _ = response.send(phase);
                    }
                    Some(OrchestratorCommand::Shutdown { response }) => {
                        self.stop_transport().await;
                        let _ = response.send(());
                        break;
                    }
                },
                event = recv_transport(&mut events) => match event {
                    TransportEvent::Line(line) => self.handle_line(&line).await,
                    TransportEvent::Exited { code } => {
                        events = None;
                        self.transport = None;
                        self.on_transport_exit(code);
                    }
                },
                _ = sleep_until_or_pending(deadline) => self.on_deadline().await,
            }
        }

        info!("scan orchestrator stopped");
    }

    // -------------------------------------------------------------------------
    // Command handling
    // -------------------------------------------------------------------------

    async fn begin_scan(
        &mut self,
        request: ScanRequest,
        events: &mut Option<mpsc::Receiver<TransportEvent>>,
    ) -> ScanResult<Uuid> {
        if self.session.is_some() {
            return Err(ScanError::ScanAlreadyActive);
        }
        request.validate()?;
        self.validate_metadata(&request).await?;

        if self.transport.is_none() {
            let mut transport = self.factory.connect().await?;
            *events = transport.take_events();
            self.transport = Some(transport);
        }

        let session = ScanSession::new(request, &self.settings.storage.scan_root);
        let session_id = session.id;
        info!(
            "scan {session_id} configuring (plant {}, {} frames)",
            session.request.plant_barcode, session.request.frames_total
        );
        self.session = Some(session);

        if let Err(e) = self.send_message(&HardwareMessage::check_hardware()).await {
            self.session = None;
            self.transport = None;
            *events = None;
            return Err(e);
        }
        self.deadline = Some(Instant::now() + self.settings.scan.configure_timeout);
        Ok(session_id)
    }

    async fn validate_metadata(&self, request: &ScanRequest) -> ScanResult<()> {
        if self
            .metadata
            .experiment(&request.experiment_id)
            .await?
            .is_none()
        {
            return Err(ScanError::InvalidRequest(format!(
                "unknown experiment '{}'",
                request.experiment_id
            )));
        }
        if self
            .metadata
            .phenotyper(&request.phenotyper_id)
            .await?
            .is_none()
        {
            return Err(ScanError::InvalidRequest(format!(
                "unknown phenotyper '{}'",
                request.phenotyper_id
            )));
        }
        Ok(())
    }

    async fn request_cancel(&mut self) -> ScanResult<()> {
        let Some(session) = self.session.as_mut() else {
            // Terminal event already handled or nothing started: no-op.
            return Ok(());
        };
        if session.cancel_requested {
            return Ok(());
        }
        session.cancel_requested = true;
        let session_id = session.id;
        self.deadline = Some(Instant::now() + self.settings.scan.cancel_grace);

        info!("scan {session_id} cancellation requested");
        if let Err(e) = self.send_message(&HardwareMessage::cancel()).await {
            // The grace deadline will still force Cancelled.
            warn!("cancel command not delivered: {e}");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Transport event handling
    // -------------------------------------------------------------------------

    async fn handle_line(&mut self, line: &str) {
        let message = match decode_line(line) {
            Ok(message) => message,
            Err(e) => {
                if self.session.is_some() {
                    self.fail_session(e);
                } else {
                    warn!("ignoring unparseable line outside a scan: {e}");
                }
                return;
            }
        };

        match message {
            HardwareMessage::Status { text } => info!("hardware: {text}"),
            HardwareMessage::Warning { text } => warn!("hardware: {text}"),
            HardwareMessage::Progress {
                frames_captured,
                frames_total,
            } => self.on_progress(frames_captured, frames_total),
            HardwareMessage::Data { payload } => self.on_data(payload).await,
            HardwareMessage::Error { text } => {
                let cancelling = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.cancel_requested);
                if cancelling {
                    self.finish_cancelled();
                } else if self.session.is_some() {
                    self.fail_session(ScanError::HardwareRejected(text));
                } else {
                    warn!("hardware error outside a scan: {text}");
                }
            }
            HardwareMessage::Command { .. } => {
                warn!("subprocess echoed a command line; ignoring");
            }
        }
    }

    fn on_progress(&mut self, frames_captured: u32, frames_total: u32) {
        let Some(session) = self.session.as_mut() else {
            debug!("progress without an active session; ignoring");
            return;
        };
        if session.phase != ScanPhase::Capturing {
            debug!("progress in phase {:?}; ignoring", session.phase);
            return;
        }
        let current = session.record_progress(frames_captured);
        let cancel_requested = session.cancel_requested;
        let window = session.inactivity_window(&self.settings.scan);
        if !cancel_requested {
            self.deadline = Some(Instant::now() + window);
        }
        self.dispatcher.emit(&ScanEvent::Progress {
            frames_captured: current,
            frames_total,
        });
    }

    async fn on_data(&mut self, payload: serde_json::Value) {
        let phase = self.session.as_ref().map(|s| s.phase);
        match phase {
            Some(ScanPhase::Configuring) => self.on_availability(payload).await,
            Some(ScanPhase::Capturing) => self.on_outcome(payload).await,
            Some(other) => debug!("DATA payload in phase {other:?}; ignoring"),
            None => debug!("DATA payload outside a scan; ignoring"),
        }
    }

    /// `check_hardware` result while `Configuring`: either proceed to
    /// `Capturing` by sending the capture command, or fail with the
    /// hardware's rejection.
    async fn on_availability(&mut self, payload: serde_json::Value) {
        let availability: HardwareAvailability = match serde_json::from_value(payload) {
            Ok(availability) => availability,
            Err(e) => {
                self.fail_session(ScanError::Protocol(format!(
                    "malformed hardware availability payload: {e}"
                )));
                return;
            }
        };

        if self.session.as_ref().is_some_and(|s| s.cancel_requested) {
            self.finish_cancelled();
            return;
        }
        if !availability.ready() {
            self.fail_session(ScanError::HardwareRejected(format!(
                "hardware not available: missing {}",
                availability.missing()
            )));
            return;
        }

        let Some((params, session_id)) = self.session.as_ref().map(|session| {
            (
                ScanParams::from_request(&session.request, session.output_dir.to_string_lossy()),
                session.id,
            )
        }) else {
            return;
        };

        let message = match HardwareMessage::start_scan(&params) {
            Ok(message) => message,
            Err(e) => {
                self.fail_session(e);
                return;
            }
        };
        if let Err(e) = self.send_message(&message).await {
            self.fail_session(e);
            return;
        }

        if let Some(session) = self.session.as_mut() {
            session.phase = ScanPhase::Capturing;
        }
        let window = self
            .session
            .as_ref()
            .map(|s| s.inactivity_window(&self.settings.scan));
        self.deadline = window.map(|w| Instant::now() + w);
        info!("scan {session_id} capturing");
    }

    /// Terminal `DATA:` result while `Capturing`.
    async fn on_outcome(&mut self, payload: serde_json::Value) {
        let outcome: ScanOutcome = match serde_json::from_value(payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_session(ScanError::Protocol(format!(
                    "malformed scan outcome payload: {e}"
                )));
                return;
            }
        };

        let cancelling = self
            .session
            .as_ref()
            .is_some_and(|s| s.cancel_requested);
        if cancelling || outcome.cancelled {
            self.finish_cancelled();
            return;
        }
        if !outcome.success {
            let message = outcome
                .error
                .unwrap_or_else(|| "scan failed without detail".to_string());
            self.fail_session(ScanError::HardwareRejected(message));
            return;
        }

        self.deadline = None;
        let completed = {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            session.phase = ScanPhase::Finalizing;
            session.record_progress(outcome.frames_captured);
            CompletedScan::from_session(session)
        };

        match self.store.persist(&completed).await {
            Ok(record_id) => {
                if let Some(session) = self.session.take() {
                    info!(
                        "scan {} completed: {} frames, record {record_id}",
                        session.id,
                        completed.frames.len()
                    );
                    self.dispatcher.emit(&ScanEvent::Complete {
                        output_path: completed.output_dir.clone(),
                        frames_captured: completed.frames.len() as u32,
                        success: true,
                    });
                }
            }
            Err(e) => {
                // Partial success: the frames exist on disk; only the record
                // write failed. Report it distinctly so the caller can retry
                // persistence without re-capturing.
                if let Some(session) = self.session.take() {
                    warn!("scan {} captured but persistence failed: {e}", session.id);
                    self.dispatcher.emit(&ScanEvent::Error {
                        message: format!(
                            "capture succeeded ({} frames at {}) but persistence failed: {e}",
                            completed.frames.len(),
                            completed.output_dir.display()
                        ),
                    });
                }
            }
        }
    }

    fn on_transport_exit(&mut self, code: Option<i32>) {
        if self.session.is_none() {
            info!("hardware process exited while idle (code {code:?})");
            return;
        }
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.cancel_requested)
        {
            // The kill we issued (or a self-exit after cancel) counts as the
            // acknowledgement.
            self.finish_cancelled();
        } else {
            self.fail_session(ScanError::TransportLost { code });
        }
    }

    async fn on_deadline(&mut self) {
        self.deadline = None;
        let (cancel_requested, window) = match self.session.as_ref() {
            None => return,
            Some(session) => (
                session.cancel_requested,
                match session.phase {
                    ScanPhase::Configuring => self.settings.scan.configure_timeout,
                    _ => session.inactivity_window(&self.settings.scan),
                },
            ),
        };

        if cancel_requested {
            // Grace expired: cancellation is authoritative toward the
            // application even if the subprocess never acknowledged.
            if let Some(mut transport) = self.transport.take() {
                transport.kill().await;
            }
            self.finish_cancelled();
        } else {
            if let Err(e) = self.send_message(&HardwareMessage::cancel()).await {
                debug!("best-effort cancel after timeout not delivered: {e}");
            }
            self.fail_session(ScanError::ScanTimeout(window));
        }
    }

    // -------------------------------------------------------------------------
    // Session termination (each takes the session, so terminal events fire
    // at most once per scan)
    // -------------------------------------------------------------------------

    fn fail_session(&mut self, error: ScanError) {
        self.deadline = None;
        if let Some(mut session) = self.session.take() {
            session.phase = ScanPhase::Failed;
            warn!("scan {} failed: {error}", session.id);
            self.dispatcher.emit(&ScanEvent::Error {
                message: error.to_string(),
            });
        } else {
            debug!("late failure with no session: {error}");
        }
    }

    fn finish_cancelled(&mut self) {
        self.deadline = None;
        if let Some(mut session) = self.session.take() {
            session.phase = ScanPhase::Cancelled;
            info!(
                "scan {} cancelled after {} frames",
                session.id, session.frames_captured
            );
            self.dispatcher.emit(&ScanEvent::Cancelled {
                frames_captured: session.frames_captured,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Transport helpers
    // -------------------------------------------------------------------------

    async fn send_message(&mut self, message: &HardwareMessage) -> ScanResult<()> {
        let line = message.encode()?;
        match self.transport.as_mut() {
            Some(transport) => transport.send(&line).await,
            None => Err(ScanError::TransportClosed(
                "no hardware process".to_string(),
            )),
        }
    }

    async fn stop_transport(&mut self) {
        if self.session.is_some() {
            self.fail_session(ScanError::TransportClosed(
                "orchestrator shutting down".to_string(),
            ));
        }
        if let Some(mut transport) = self.transport.take() {
            transport.kill().await;
        }
    }
}

async fn recv_transport(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> TransportEvent {
    match events.as_mut() {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            // Stream closed without an explicit exit event: same thing.
            None => TransportEvent::Exited { code: None },
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::InMemoryMetadataStore;
    use crate::storage::FsScanStore;
    use crate::transport::{MockTransport, QueuedTransportFactory};
    use tempfile::tempdir;

    fn test_settings(root: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.storage.scan_root = root.to_path_buf();
        settings
    }

    #[tokio::test]
    async fn test_unknown_experiment_rejected_before_hardware() {
        let dir = tempdir().expect("tempdir");
        let (transport, mut mock) = MockTransport::manual(8);
        let handle = ScanOrchestrator::spawn(
            test_settings(dir.path()),
            Box::new(QueuedTransportFactory::new(vec![Box::new(transport)])),
            Arc::new(FsScanStore::new()),
            Arc::new(InMemoryMetadataStore::new()), // empty: nothing is known
        );

        let err = handle
            .start_scan(ScanRequest::sample())
            .await
            .expect_err("must reject");
        assert!(matches!(err, ScanError::InvalidRequest(_)));
        assert!(
            mock.commands.try_recv().is_err(),
            "no command reaches the hardware for an invalid request"
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_phase_is_idle_before_any_scan() {
        let dir = tempdir().expect("tempdir");
        let handle = ScanOrchestrator::spawn(
            test_settings(dir.path()),
            Box::new(QueuedTransportFactory::new(vec![])),
            Arc::new(FsScanStore::new()),
            Arc::new(InMemoryMetadataStore::with_sample_data()),
        );
        assert_eq!(handle.phase().await.expect("phase"), ScanPhase::Idle);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_without_scan_is_noop() {
        let dir = tempdir().expect("tempdir");
        let handle = ScanOrchestrator::spawn(
            test_settings(dir.path()),
            Box::new(QueuedTransportFactory::new(vec![])),
            Arc::new(FsScanStore::new()),
            Arc::new(InMemoryMetadataStore::with_sample_data()),
        );
        handle.cancel().await.expect("noop cancel");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_factory_failure_surfaces_as_transport_unavailable() {
        let dir = tempdir().expect("tempdir");
        let handle = ScanOrchestrator::spawn(
            test_settings(dir.path()),
            Box::new(QueuedTransportFactory::new(vec![])), // nothing to hand out
            Arc::new(FsScanStore::new()),
            Arc::new(InMemoryMetadataStore::with_sample_data()),
        );
        let err = handle
            .start_scan(ScanRequest::sample())
            .await
            .expect_err("must fail");
        assert!(matches!(err, ScanError::TransportUnavailable(_)));
        // And the orchestrator is still usable.
        assert_eq!(handle.phase().await.expect("phase"), ScanPhase::Idle);
        handle.shutdown().await;
    }
}
