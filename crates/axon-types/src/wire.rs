//! Newline-delimited text protocol between the bridge server and its clients.
//!
//! | Direction | Line |
//! |---|---|
//! | server → client | `TEL <seq> <calibration_status> <json SensorSample>` |
//! | server → client | `CMD <seq> <client_id> <raw_text>` |
//! | server → client | `# <notice>` (informational, e.g. the welcome banner) |
//! | client → server | any other non-empty line is a command to forward |
//!
//! Sequence numbers are assigned by the server's broadcast stage and are
//! strictly increasing across both frame kinds.

use crate::{AxonError, CalibrationStatus, SensorSample};

/// Prefix of informational lines that are neither telemetry nor echoes.
pub const NOTICE_PREFIX: char = '#';

/// One server → client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryFrame {
    /// One sample (or heartbeat) with the calibrator's status.
    Telemetry {
        seq: u64,
        status: CalibrationStatus,
        sample: SensorSample,
    },
    /// Echo of a command accepted from any client.
    CommandEcho {
        seq: u64,
        client_id: u64,
        raw_text: String,
    },
}

impl TelemetryFrame {
    pub fn seq(&self) -> u64 {
        match self {
            TelemetryFrame::Telemetry { seq, .. } | TelemetryFrame::CommandEcho { seq, .. } => *seq,
        }
    }

    /// Encode as one wire line, including the trailing `\n`.
    ///
    /// Line breaks inside an echoed command are flattened to spaces so that
    /// one frame always occupies exactly one line.
    pub fn encode(&self) -> Result<String, AxonError> {
        match self {
            TelemetryFrame::Telemetry {
                seq,
                status,
                sample,
            } => {
                let json = serde_json::to_string(sample)
                    .map_err(|e| AxonError::Serialization(e.to_string()))?;
                Ok(format!("TEL {seq} {status} {json}\n"))
            }
            TelemetryFrame::CommandEcho {
                seq,
                client_id,
                raw_text,
            } => {
                let text: String = raw_text
                    .chars()
                    .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
                    .collect();
                Ok(format!("CMD {seq} {client_id} {text}\n"))
            }
        }
    }

    /// Parse one line (with or without its trailing newline).
    ///
    /// # Errors
    ///
    /// Returns [`AxonError::Protocol`] for unknown tags, missing fields, or
    /// non-numeric sequence/client ids, and [`AxonError::Serialization`] when
    /// the telemetry JSON does not decode.
    pub fn parse(line: &str) -> Result<Self, AxonError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(4, ' ');
        let tag = parts.next().unwrap_or("");
        let seq = parse_u64(parts.next(), "sequence number")?;

        match tag {
            "TEL" => {
                let status: CalibrationStatus = parts
                    .next()
                    .ok_or_else(|| AxonError::Protocol("TEL frame missing status".to_string()))?
                    .parse()?;
                let json = parts
                    .next()
                    .ok_or_else(|| AxonError::Protocol("TEL frame missing sample".to_string()))?;
                let sample: SensorSample = serde_json::from_str(json)
                    .map_err(|e| AxonError::Serialization(format!("TEL sample: {e}")))?;
                Ok(TelemetryFrame::Telemetry {
                    seq,
                    status,
                    sample,
                })
            }
            "CMD" => {
                let client_id = parse_u64(parts.next(), "client id")?;
                let raw_text = parts
                    .next()
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| AxonError::Protocol("CMD frame missing text".to_string()))?;
                Ok(TelemetryFrame::CommandEcho {
                    seq,
                    client_id,
                    raw_text: raw_text.to_string(),
                })
            }
            other => Err(AxonError::Protocol(format!("unknown frame tag '{other}'"))),
        }
    }
}

/// `true` for `#`-prefixed informational lines.
pub fn is_notice(line: &str) -> bool {
    line.starts_with(NOTICE_PREFIX)
}

/// Build a notice line (with trailing newline) from free text.
pub fn notice_line(text: &str) -> String {
    format!("{NOTICE_PREFIX} {}\n", text.trim())
}

fn parse_u64(field: Option<&str>, what: &str) -> Result<u64, AxonError> {
    let raw = field.ok_or_else(|| AxonError::Protocol(format!("frame missing {what}")))?;
    raw.parse::<u64>()
        .map_err(|_| AxonError::Protocol(format!("invalid {what} '{raw}'")))
}
