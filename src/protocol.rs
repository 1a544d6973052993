//! Wire codec for the hardware subprocess protocol.
//!
//! The hardware backend speaks a line-delimited, UTF-8 protocol over stdio:
//!
//! - Commands (orchestrator → subprocess) are one flat JSON object per line:
//!   `{"command":"check_hardware"}`,
//!   `{"command":"start_scan","params":{...}}`, `{"command":"cancel"}`.
//! - Responses (subprocess → orchestrator) carry a fixed prefix:
//!   `STATUS:<text>`, `WARNING:<text>`, `DATA:<json>`, `ERROR:<text>`,
//!   `PROGRESS:<captured>/<total>`.
//!
//! Decoding fails closed: a line that matches none of the known prefixes is a
//! [`ScanError::Protocol`], never silently dropped, so a malformed or
//! mismatched-version subprocess cannot desynchronize the orchestrator.

use crate::error::{ScanError, ScanResult};
use crate::scan::ScanParams;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One protocol unit, either direction.
#[derive(Clone, Debug, PartialEq)]
pub enum HardwareMessage {
    /// Orchestrator → subprocess command.
    Command { name: String, args: Option<Value> },
    /// Informational status line.
    Status { text: String },
    /// Non-fatal warning line.
    Warning { text: String },
    /// Structured result payload (e.g. hardware-availability check, scan
    /// outcome).
    Data { payload: Value },
    /// Failure signal.
    Error { text: String },
    /// Scan-in-progress counter.
    Progress {
        frames_captured: u32,
        frames_total: u32,
    },
}

impl HardwareMessage {
    /// Encodes a command message as one JSON line (without the trailing
    /// newline). Only `Command` values are encodable; responses are produced
    /// by the subprocess.
    pub fn encode(&self) -> ScanResult<String> {
        match self {
            HardwareMessage::Command { name, args } => {
                let mut obj = json!({ "command": name });
                if let Some(args) = args {
                    if let Some(map) = obj.as_object_mut() {
                        map.insert("params".to_string(), args.clone());
                    }
                }
                Ok(obj.to_string())
            }
            other => Err(ScanError::Protocol(format!(
                "only commands are encoded by the orchestrator, got {other:?}"
            ))),
        }
    }

    /// Convenience constructor for `{"command":"check_hardware"}`.
    pub fn check_hardware() -> Self {
        HardwareMessage::Command {
            name: "check_hardware".to_string(),
            args: None,
        }
    }

    /// Convenience constructor for `{"command":"start_scan","params":{...}}`.
    pub fn start_scan(params: &ScanParams) -> ScanResult<Self> {
        let args = serde_json::to_value(params)
            .map_err(|e| ScanError::Protocol(format!("failed to encode scan params: {e}")))?;
        Ok(HardwareMessage::Command {
            name: "start_scan".to_string(),
            args: Some(args),
        })
    }

    /// Convenience constructor for `{"command":"cancel"}`.
    pub fn cancel() -> Self {
        HardwareMessage::Command {
            name: "cancel".to_string(),
            args: None,
        }
    }
}

/// Decodes one subprocess output line into a typed message.
///
/// Fails closed: unknown prefixes and malformed payloads are protocol
/// errors.
pub fn decode_line(line: &str) -> ScanResult<HardwareMessage> {
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(text) = line.strip_prefix("STATUS:") {
        return Ok(HardwareMessage::Status {
            text: text.to_string(),
        });
    }
    if let Some(text) = line.strip_prefix("WARNING:") {
        return Ok(HardwareMessage::Warning {
            text: text.to_string(),
        });
    }
    if let Some(text) = line.strip_prefix("ERROR:") {
        return Ok(HardwareMessage::Error {
            text: text.to_string(),
        });
    }
    if let Some(payload) = line.strip_prefix("DATA:") {
        let payload: Value = serde_json::from_str(payload)
            .map_err(|_| ScanError::Protocol(format!("malformed DATA payload: {line:?}")))?;
        return Ok(HardwareMessage::Data { payload });
    }
    if let Some(counter) = line.strip_prefix("PROGRESS:") {
        let (captured, total) = counter
            .split_once('/')
            .ok_or_else(|| ScanError::Protocol(format!("malformed PROGRESS line: {line:?}")))?;
        let frames_captured = captured
            .trim()
            .parse::<u32>()
            .map_err(|_| ScanError::Protocol(format!("malformed PROGRESS line: {line:?}")))?;
        let frames_total = total
            .trim()
            .parse::<u32>()
            .map_err(|_| ScanError::Protocol(format!("malformed PROGRESS line: {line:?}")))?;
        return Ok(HardwareMessage::Progress {
            frames_captured,
            frames_total,
        });
    }

    Err(ScanError::Protocol(line.to_string()))
}

/// Availability of one device class as reported by `check_hardware`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAvailability {
    /// The driver library is installed on the hardware host.
    #[serde(default)]
    pub library_available: bool,
    /// Number of physical devices detected.
    #[serde(default)]
    pub devices_found: u32,
    /// Library installed and at least one device present.
    #[serde(default)]
    pub available: bool,
}

/// `DATA:` payload of the `check_hardware` command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareAvailability {
    #[serde(default)]
    pub camera: DeviceAvailability,
    #[serde(default)]
    pub daq: DeviceAvailability,
}

impl HardwareAvailability {
    /// True when both the camera and the turntable DAQ can be used.
    pub fn ready(&self) -> bool {
        self.camera.available && self.daq.available
    }

    /// Human-readable description of what is missing, for rejection messages.
    pub fn missing(&self) -> String {
        let mut missing = Vec::new();
        if !self.camera.available {
            missing.push("camera");
        }
        if !self.daq.available {
            missing.push("turntable DAQ");
        }
        missing.join(" and ")
    }
}

/// Terminal `DATA:` payload emitted by the subprocess when a scan ends.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub frames_captured: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanRequest;

    #[test]
    fn test_encode_check_hardware() {
        let line = HardwareMessage::check_hardware().encode().expect("encode");
        assert_eq!(line, r#"{"command":"check_hardware"}"#);
    }

    #[test]
    fn test_encode_start_scan_includes_params() {
        let request = ScanRequest::sample();
        let params = ScanParams::from_request(&request, "/tmp/scan-out");
        let line = HardwareMessage::start_scan(&params)
            .expect("build")
            .encode()
            .expect("encode");
        let value: Value = serde_json::from_str(&line).expect("valid json");
        assert_eq!(value["command"], "start_scan");
        assert_eq!(value["params"]["plant_barcode"], request.plant_barcode);
        assert_eq!(value["params"]["output_path"], "/tmp/scan-out");
    }

    #[test]
    fn test_decode_status_and_warning() {
        assert_eq!(
            decode_line("STATUS:Turntable homed to 0°").expect("decode"),
            HardwareMessage::Status {
                text: "Turntable homed to 0°".to_string()
            }
        );
        assert!(matches!(
            decode_line("WARNING:Frame 3 capture failed").expect("decode"),
            HardwareMessage::Warning { .. }
        ));
    }

    #[test]
    fn test_decode_progress() {
        let msg = decode_line("PROGRESS:7/72").expect("decode");
        assert_eq!(
            msg,
            HardwareMessage::Progress {
                frames_captured: 7,
                frames_total: 72
            }
        );
    }

    #[test]
    fn test_decode_data_availability() {
        let line = r#"DATA:{"camera":{"library_available":true,"devices_found":1,"available":true},"daq":{"library_available":true,"devices_found":1,"available":true}}"#;
        let msg = decode_line(line).expect("decode");
        let HardwareMessage::Data { payload } = msg else {
            panic!("expected DATA message");
        };
        let availability: HardwareAvailability =
            serde_json::from_value(payload).expect("typed payload");
        assert!(availability.ready());
    }

    #[test]
    fn test_missing_devices_described() {
        let availability = HardwareAvailability::default();
        assert_eq!(availability.missing(), "camera and turntable DAQ");
    }

    #[test]
    fn test_unknown_prefix_fails_closed() {
        let err = decode_line("FRAME:data:image/png;base64,AAAA").expect_err("must fail");
        assert!(matches!(err, ScanError::Protocol(_)));
    }

    #[test]
    fn test_malformed_progress_fails_closed() {
        assert!(decode_line("PROGRESS:7of72").is_err());
        assert!(decode_line("PROGRESS:a/b").is_err());
    }

    #[test]
    fn test_malformed_data_fails_closed() {
        assert!(decode_line("DATA:{not json").is_err());
    }
}
