use crate::frame::Frame;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info};

/// Default bound on a single transmission, keeping the replay loop moving on a hung bus.
pub const DEFAULT_TRANSMIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Polling interval while waiting for a transmit command to exit.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Stderr fragments the bus-send utility prints when the interface does not exist.
const INTERFACE_MISSING_MARKERS: [&str; 2] = ["if_nametoindex", "No such device"];

/// Why a frame was not accepted by the transmission primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransmitError {
    /// The named bus interface does not exist or is down.
    #[error("CAN interface '{0}' is not available")]
    InterfaceUnavailable(String),
    /// Generic failure: malformed frame, bus busy, non-zero exit.
    #[error("Frame rejected: {0}")]
    Rejected(String),
    /// The primitive did not answer within its time bound.
    #[error("Transmission timed out after {0:?}")]
    Timeout(Duration),
    /// The primitive could not be started at all.
    #[error("Failed to launch transmit command: {0}")]
    Spawn(String),
}

/// Coarse failure classes used for counting and log suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InterfaceUnavailable,
    Rejected,
}

impl TransmitError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransmitError::InterfaceUnavailable(_) => FailureKind::InterfaceUnavailable,
            TransmitError::Rejected(_) | TransmitError::Timeout(_) | TransmitError::Spawn(_) => {
                FailureKind::Rejected
            }
        }
    }
}

/// The external capability the replay core depends on: put one wire-format frame
/// (`ID#HEXDATA`) on a named bus.
pub trait Transmit {
    fn transmit(&mut self, interface: &str, wire_frame: &str) -> Result<(), TransmitError>;
}

/// Adapts a closure into a [`Transmit`] implementation; handy for in-process sinks and tests.
pub struct FnTransmitter<F>
where
    F: FnMut(&str, &str) -> Result<(), TransmitError>,
{
    transmit_fn: F,
}

impl<F> FnTransmitter<F>
where
    F: FnMut(&str, &str) -> Result<(), TransmitError>,
{
    pub fn new(transmit_fn: F) -> Self {
        Self { transmit_fn }
    }
}

impl<F> Transmit for FnTransmitter<F>
where
    F: FnMut(&str, &str) -> Result<(), TransmitError>,
{
    fn transmit(&mut self, interface: &str, wire_frame: &str) -> Result<(), TransmitError> {
        (self.transmit_fn)(interface, wire_frame)
    }
}

/// Runs an external bus-send utility (`cansend <interface> <frame>` by default) per frame.
///
/// `command` is the program plus any leading arguments; the interface and the wire frame
/// are appended as the last two arguments. Each invocation is killed once `timeout` expires.
pub struct CommandTransmitter {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandTransmitter {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub fn cansend() -> Self {
        Self::new(vec!["cansend".to_string()], DEFAULT_TRANSMIT_TIMEOUT)
    }

    fn wait_with_timeout(&self, child: &mut Child) -> Result<ExitStatus, TransmitError> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > self.timeout {
                        if let Err(e) = child.kill() {
                            return Err(TransmitError::Rejected(format!(
                                "Failed to kill timed-out transmit command: {e}"
                            )));
                        }
                        let _ = child.wait();
                        return Err(TransmitError::Timeout(self.timeout));
                    }
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(TransmitError::Rejected(format!(
                        "Error waiting for transmit command: {e}"
                    )));
                }
            }
        }
    }
}

impl Transmit for CommandTransmitter {
    fn transmit(&mut self, interface: &str, wire_frame: &str) -> Result<(), TransmitError> {
        let Some((program, leading_args)) = self.command.split_first() else {
            return Err(TransmitError::Spawn("Transmit command is empty".to_string()));
        };

        let mut child = Command::new(program)
            .args(leading_args)
            .arg(interface)
            .arg(wire_frame)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransmitError::Spawn(format!("'{program}': {e}")))?;

        let status = self.wait_with_timeout(&mut child)?;
        if status.success() {
            return Ok(());
        }

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let stderr = stderr.trim();

        if INTERFACE_MISSING_MARKERS.iter().any(|m| stderr.contains(m)) {
            return Err(TransmitError::InterfaceUnavailable(interface.to_string()));
        }
        let detail = if stderr.is_empty() {
            match status.code() {
                Some(code) => format!("exited with code {code}"),
                None => "terminated by signal".to_string(),
            }
        } else {
            stderr.to_string()
        };
        Err(TransmitError::Rejected(detail))
    }
}

/// Delivery counters for one run. `sent == succeeded + failed` holds after every update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmissionStats {
    sent: u64,
    succeeded: u64,
    failed: u64,
}

impl TransmissionStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_success(&mut self) {
        self.succeeded += 1;
        self.sent += 1;
    }

    fn record_failure(&mut self) {
        self.failed += 1;
        self.sent += 1;
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// `succeeded / sent`, or 0 when nothing was sent.
    pub fn success_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.sent as f64
        }
    }
}

/// What happened to one frame handed to [`FrameTransmitter::transmit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// 1-based position of this frame in the run.
    pub sequence: u64,
    pub wire: String,
    pub error: Option<TransmitError>,
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Formats frames, hands them to a [`Transmit`] primitive, and keeps the run's counters.
///
/// A failed frame never stops the caller. A missing interface is reported loudly once and
/// quietly afterwards; every other failure is logged each time it happens.
pub struct FrameTransmitter<T: Transmit> {
    primitive: T,
    stats: TransmissionStats,
    interface_reported: bool,
}

impl<T: Transmit> FrameTransmitter<T> {
    pub fn new(primitive: T) -> Self {
        Self {
            primitive,
            stats: TransmissionStats::new(),
            interface_reported: false,
        }
    }

    /// Sends `frame` on `interface`; `true` when the primitive accepted it.
    pub fn send(&mut self, frame: &Frame, interface: &str) -> bool {
        self.transmit(frame, interface).is_success()
    }

    /// Sends `frame` on `interface` and returns the full outcome.
    pub fn transmit(&mut self, frame: &Frame, interface: &str) -> SendOutcome {
        let wire = frame.to_wire();
        let result = self.primitive.transmit(interface, &wire);
        let sequence = self.stats.sent + 1;

        match result {
            Ok(()) => {
                self.stats.record_success();
                info!("Sent #{} | {} FRAME={}", sequence, frame, wire);
                SendOutcome {
                    sequence,
                    wire,
                    error: None,
                }
            }
            Err(err) => {
                self.stats.record_failure();
                self.report_failure(&err, interface, &wire, sequence);
                SendOutcome {
                    sequence,
                    wire,
                    error: Some(err),
                }
            }
        }
    }

    fn report_failure(&mut self, err: &TransmitError, interface: &str, wire: &str, sequence: u64) {
        match err.kind() {
            FailureKind::InterfaceUnavailable if !self.interface_reported => {
                self.interface_reported = true;
                error!("CAN interface '{}' was not found", interface);
                error!("  Check:  ip link show {}", interface);
                error!(
                    "  Enable: sudo ip link set {} up type can bitrate 500000",
                    interface
                );
            }
            FailureKind::InterfaceUnavailable => {
                debug!("Failed #{} | {} - {}", sequence, wire, err);
            }
            FailureKind::Rejected => {
                error!("Failed #{} | {} - {}", sequence, wire, err);
            }
        }
    }

    pub fn stats(&self) -> &TransmissionStats {
        &self.stats
    }

    pub fn primitive(&self) -> &T {
        &self.primitive
    }
}
