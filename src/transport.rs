//! Hardware subprocess transport.
//!
//! [`HardwareProcess`] owns the lifecycle of the hardware-control subprocess:
//! it spawns the executable with piped stdio, frames stdout into discrete
//! lines, and detects process death. Exactly one subprocess exists per
//! transport instance; the orchestrator respawns through a
//! [`TransportFactory`] only after the previous process is gone.
//!
//! Lines flow through a bounded channel: when the orchestrator falls behind,
//! the reader task stops consuming stdout instead of buffering unboundedly.
//!
//! [`MockTransport`] is the in-process twin used by tests and the CLI demo
//! mode, mirroring how the rest of the crate keeps a mock beside each real
//! driver.

use crate::config::TransportSettings;
use crate::error::{ScanError, ScanResult};
use crate::protocol::{decode_line, HardwareMessage, ScanOutcome};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

/// What the transport delivers to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One stdout line from the subprocess.
    Line(String),
    /// The subprocess exited. Always the final event.
    Exited { code: Option<i32> },
}

/// Byte-stream-agnostic seam between the orchestrator and the subprocess.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes one newline-terminated message to the subprocess input.
    async fn send(&mut self, line: &str) -> ScanResult<()>;

    /// Hands out the event receiver. Yields `Some` exactly once; the
    /// orchestrator owns the receiver for the transport's lifetime.
    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Forcibly terminates the subprocess. Best effort; used when the
    /// cancel grace period expires.
    async fn kill(&mut self);
}

/// Creates transports on demand so the orchestrator can recover from a dead
/// subprocess on the next scan.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&mut self) -> ScanResult<Box<dyn Transport>>;
}

// =============================================================================
// Real subprocess transport
// =============================================================================

/// Transport backed by the real hardware-control subprocess.
pub struct HardwareProcess {
    stdin: ChildStdin,
    events: Option<mpsc::Receiver<TransportEvent>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl HardwareProcess {
    /// Spawns the subprocess and waits for its `STATUS:` ready banner.
    ///
    /// Fails with `TransportUnavailable` if the executable cannot be started
    /// or no banner arrives within `spawn_timeout`.
    pub async fn spawn(settings: &TransportSettings) -> ScanResult<Self> {
        let mut child = Command::new(&settings.executable)
            .args(&settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ScanError::TransportUnavailable(format!(
                    "failed to spawn {}: {e}",
                    settings.executable.display()
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ScanError::TransportUnavailable("subprocess stdin not piped".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ScanError::TransportUnavailable("subprocess stdout not piped".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ScanError::TransportUnavailable("subprocess stderr not piped".to_string())
        })?;

        let (line_tx, mut line_rx) = mpsc::channel(settings.line_channel_capacity);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(pump_stdout(child, stdout, line_tx, kill_rx));
        tokio::spawn(drain_stderr(stderr));

        wait_for_ready(&mut line_rx, settings.spawn_timeout).await?;

        Ok(Self {
            stdin,
            events: Some(line_rx),
            kill_tx: Some(kill_tx),
        })
    }
}

#[async_trait]
impl Transport for HardwareProcess {
    async fn send(&mut self, line: &str) -> ScanResult<()> {
        debug!("-> hardware: {line}");
        let framed = format!("{line}\n");
        self.stdin
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| ScanError::TransportClosed(e.to_string()))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| ScanError::TransportClosed(e.to_string()))
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.take()
    }

    async fn kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}

/// Reads stdout lines into the bounded channel; when the channel is full the
/// `send().await` below parks this task, which stops stdout consumption
/// until the consumer drains (backpressure). Always emits `Exited` last.
async fn pump_stdout(
    mut child: Child,
    stdout: ChildStdout,
    tx: mpsc::Sender<TransportEvent>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if tx.send(TransportEvent::Line(line)).await.is_err() {
                        // Consumer gone; stop the child rather than let it
                        // stream into the void.
                        let _ = child.start_kill();
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("hardware stdout read failed: {e}");
                    break;
                }
            },
            _ = &mut kill_rx => {
                let _ = child.start_kill();
                break;
            }
        }
    }

    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("failed to reap hardware process: {e}");
            None
        }
    };
    info!("hardware process exited with code {code:?}");
    let _ = tx.send(TransportEvent::Exited { code }).await;
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!("hardware stderr: {line}");
    }
}

/// Consumes events until a `STATUS:` ready banner arrives. Import warnings
/// and errors printed before the banner are logged, not fatal; exit or
/// silence is.
async fn wait_for_ready(
    rx: &mut mpsc::Receiver<TransportEvent>,
    spawn_timeout: Duration,
) -> ScanResult<()> {
    let deadline = Instant::now() + spawn_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, rx.recv()).await {
            Err(_) => {
                return Err(ScanError::TransportUnavailable(format!(
                    "no ready banner within {spawn_timeout:?}"
                )))
            }
            Ok(None) | Ok(Some(TransportEvent::Exited { .. })) => {
                return Err(ScanError::TransportUnavailable(
                    "hardware process exited before becoming ready".to_string(),
                ))
            }
            Ok(Some(TransportEvent::Line(line))) => match decode_line(&line) {
                Ok(HardwareMessage::Status { text }) => {
                    info!("hardware ready: {text}");
                    return Ok(());
                }
                Ok(HardwareMessage::Warning { text }) | Ok(HardwareMessage::Error { text }) => {
                    warn!("hardware startup: {text}");
                }
                Ok(other) => debug!("ignoring pre-ready message: {other:?}"),
                Err(e) => warn!("unparseable pre-ready line: {e}"),
            },
        }
    }
}

/// Factory for the real subprocess transport.
pub struct ProcessTransportFactory {
    settings: TransportSettings,
}

impl ProcessTransportFactory {
    pub fn new(settings: TransportSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TransportFactory for ProcessTransportFactory {
    async fn connect(&mut self) -> ScanResult<Box<dyn Transport>> {
        Ok(Box::new(HardwareProcess::spawn(&self.settings).await?))
    }
}

// =============================================================================
// Mock transport
// =============================================================================

/// Test/demo transport that never touches a real process.
///
/// `manual` mode hands the test a [`MockHandle`] to observe sent commands
/// and inject events; `simulated` mode runs a task that answers the protocol
/// like the real hardware backend would.
pub struct MockTransport {
    command_tx: mpsc::UnboundedSender<String>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    task: Option<JoinHandle<()>>,
}

/// Test-side controls for a manual [`MockTransport`].
pub struct MockHandle {
    /// Inject subprocess output. Dropping this sender closes the event
    /// stream, which the orchestrator treats as process death.
    pub events: mpsc::Sender<TransportEvent>,
    /// Observe the raw command lines the orchestrator sent.
    pub commands: mpsc::UnboundedReceiver<String>,
}

impl MockTransport {
    /// Transport whose responses are scripted by the test.
    pub fn manual(capacity: usize) -> (Self, MockHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(capacity);
        (
            Self {
                command_tx,
                events: Some(events_rx),
                task: None,
            },
            MockHandle {
                events: events_tx,
                commands,
            },
        )
    }

    /// Self-driving transport: reports available hardware, then for each
    /// `start_scan` emits one progress line per `frame_interval` and a
    /// success outcome, honoring `cancel` mid-scan.
    pub fn simulated(default_frames: u32, frame_interval: Duration) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(64);
        let task = tokio::spawn(run_simulated(
            command_rx,
            events_tx,
            default_frames,
            frame_interval,
        ));
        Self {
            command_tx,
            events: Some(events_rx),
            task: Some(task),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, line: &str) -> ScanResult<()> {
        self.command_tx
            .send(line.to_string())
            .map_err(|_| ScanError::TransportClosed("mock transport stopped".to_string()))
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.take()
    }

    async fn kill(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn command_name(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    Some(value.get("command")?.as_str()?.to_string())
}

async fn run_simulated(
    mut commands: mpsc::UnboundedReceiver<String>,
    events: mpsc::Sender<TransportEvent>,
    default_frames: u32,
    frame_interval: Duration,
) {
    let send_line = |text: String| {
        let events = events.clone();
        async move { events.send(TransportEvent::Line(text)).await.is_ok() }
    };

    while let Some(line) = commands.recv().await {
        match command_name(&line).as_deref() {
            Some("check_hardware") => {
                let payload = json!({
                    "camera": {"library_available": true, "devices_found": 1, "available": true},
                    "daq": {"library_available": true, "devices_found": 1, "available": true},
                });
                if !send_line(format!("DATA:{payload}")).await {
                    return;
                }
            }
            Some("cancel") => {
                if !send_line("STATUS:No scan active".to_string()).await {
                    return;
                }
            }
            Some("start_scan") => {
                let params: Value = serde_json::from_str(&line).unwrap_or(Value::Null);
                let frames_total = params["params"]["frames_total"]
                    .as_u64()
                    .map_or(default_frames, |v| v as u32);
                let output_path = params["params"]["output_path"]
                    .as_str()
                    .unwrap_or("")
                    .to_string();

                if !send_line("STATUS:Starting scan".to_string()).await {
                    return;
                }

                let mut captured = 0;
                let mut cancelled = false;
                while captured < frames_total {
                    tokio::select! {
                        _ = tokio::time::sleep(frame_interval) => {
                            captured += 1;
                            if !send_line(format!("PROGRESS:{captured}/{frames_total}")).await {
                                return;
                            }
                        }
                        next = commands.recv() => match next.as_deref().map(command_name) {
                            Some(Some(name)) if name == "cancel" => {
                                cancelled = true;
                                break;
                            }
                            Some(_) => {}
                            None => return,
                        }
                    }
                }

                let outcome = ScanOutcome {
                    success: !cancelled,
                    frames_captured: captured,
                    output_path: Some(output_path),
                    error: cancelled.then(|| "Scan cancelled".to_string()),
                    cancelled,
                };
                let payload = match serde_json::to_string(&outcome) {
                    Ok(payload) => payload,
                    Err(_) => return,
                };
                if !send_line(format!("DATA:{payload}")).await {
                    return;
                }
            }
            _ => {
                if !send_line(format!("ERROR:Unknown command: {line}")).await {
                    return;
                }
            }
        }
    }
}

/// Factory that hands out pre-built transports, one per `connect` call.
/// Used by tests that script each scan's transport separately.
pub struct QueuedTransportFactory {
    queue: VecDeque<Box<dyn Transport>>,
}

impl QueuedTransportFactory {
    pub fn new(transports: Vec<Box<dyn Transport>>) -> Self {
        Self {
            queue: transports.into(),
        }
    }
}

#[async_trait]
impl TransportFactory for QueuedTransportFactory {
    async fn connect(&mut self) -> ScanResult<Box<dyn Transport>> {
        self.queue.pop_front().ok_or_else(|| {
            ScanError::TransportUnavailable("no further scripted transports".to_string())
        })
    }
}

/// Factory producing a fresh simulated transport per connection.
pub struct SimulatedTransportFactory {
    pub default_frames: u32,
    pub frame_interval: Duration,
}

#[async_trait]
impl TransportFactory for SimulatedTransportFactory {
    async fn connect(&mut self) -> ScanResult<Box<dyn Transport>> {
        Ok(Box::new(MockTransport::simulated(
            self.default_frames,
            self.frame_interval,
        )))
    }
}
