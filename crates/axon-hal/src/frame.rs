//! Firmware line protocol.
//!
//! The board prints one JSON object per `\n`-terminated line:
//!
//! ```text
//! {"T":1001,"ax":0.01,"ay":0.0,"az":0.99,"gx":0.9,"gy":-0.4,"gz":0.6,"v":12.2,"bat":87,"lq":100}
//! ```
//!
//! | Field | Meaning | Required |
//! |---|---|---|
//! | `ax` `ay` `az` | acceleration in g | yes |
//! | `gx` `gy` `gz` | angular rate in deg/s | yes |
//! | `v` | battery voltage | no (0.0) |
//! | `bat` | battery percentage | no (0.0) |
//! | `lq` | link quality 0–100 | no (100) |
//! | `T` | device uptime, ignored | no |
//!
//! Some firmware builds echo a `Received:` prefix; it is stripped.  A
//! trailing `*HH` (XOR of the payload bytes in hex) is verified when present.

use axon_types::{LinkError, SensorReading, Vec3};
use serde::Deserialize;

/// Longest line accepted from the device, terminator excluded.
pub const MAX_LINE_BYTES: usize = 512;

const ECHO_PREFIX: &str = "Received:";

#[derive(Debug, Deserialize)]
struct FirmwareFrame {
    #[serde(rename = "T", default)]
    _uptime_ms: Option<f64>,
    ax: f64,
    ay: f64,
    az: f64,
    gx: f64,
    gy: f64,
    gz: f64,
    #[serde(default)]
    v: f64,
    #[serde(default)]
    bat: f64,
    #[serde(default = "full_link")]
    lq: u8,
}

fn full_link() -> u8 {
    100
}

/// XOR of every byte in `payload`.
pub fn checksum(payload: &str) -> u8 {
    payload.bytes().fold(0, |acc, b| acc ^ b)
}

/// Decode one line (terminator already removed).
///
/// Returns `Ok(None)` for blank lines.
pub fn decode_line(line: &[u8]) -> Result<Option<SensorReading>, LinkError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| LinkError::Malformed("line is not valid UTF-8".to_string()))?;
    let mut text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    if let Some(rest) = text.strip_prefix(ECHO_PREFIX) {
        text = rest.trim_start();
    }

    let payload = strip_checksum(text)?;
    let frame: FirmwareFrame = serde_json::from_str(payload)
        .map_err(|e| LinkError::Malformed(format!("invalid frame: {e}")))?;

    let values = [frame.ax, frame.ay, frame.az, frame.gx, frame.gy, frame.gz];
    if values.iter().any(|v| !v.is_finite()) {
        return Err(LinkError::Malformed("non-finite motion value".to_string()));
    }

    Ok(Some(SensorReading {
        accel: Vec3::new(frame.ax, frame.ay, frame.az),
        gyro: Vec3::new(frame.gx, frame.gy, frame.gz),
        battery_voltage: frame.v,
        battery_percent: frame.bat,
        link_quality: frame.lq,
    }))
}

/// Split off and verify an optional `*HH` suffix.
fn strip_checksum(text: &str) -> Result<&str, LinkError> {
    let Some(star) = text.rfind('*') else {
        return Ok(text);
    };
    let (payload, suffix) = text.split_at(star);
    let digits = &suffix[1..];
    if digits.len() != 2 || !payload.ends_with('}') {
        return Ok(text);
    }
    let expected = u8::from_str_radix(digits, 16)
        .map_err(|_| LinkError::Malformed(format!("invalid checksum '{digits}'")))?;
    let actual = checksum(payload);
    if actual != expected {
        return Err(LinkError::Malformed(format!(
            "checksum mismatch: expected {expected:02X}, computed {actual:02X}"
        )));
    }
    Ok(payload)
}

/// Byte accumulator that yields one decode result per complete line.
///
/// A line that outgrows [`MAX_LINE_BYTES`] is reported once as malformed and
/// the rest of it is skipped up to the next newline.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_line: usize,
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(128),
            max_line,
            discarding: false,
        }
    }

    /// Drop any partial line, e.g. after the port was re-opened.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<SensorReading, LinkError>> {
        let mut out = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                self.buffer.clear();
                continue;
            }

            self.buffer.extend_from_slice(head);
            if self.buffer.len() > self.max_line {
                out.push(Err(self.overlong()));
            } else {
                match decode_line(&self.buffer) {
                    Ok(Some(reading)) => out.push(Ok(reading)),
                    Ok(None) => {}
                    Err(e) => out.push(Err(e)),
                }
            }
            self.buffer.clear();
        }

        if !self.discarding {
            self.buffer.extend_from_slice(rest);
            if self.buffer.len() > self.max_line {
                out.push(Err(self.overlong()));
                self.buffer.clear();
                self.discarding = true;
            }
        }

        out
    }

    fn overlong(&self) -> LinkError {
        LinkError::Malformed(format!("line exceeds {} bytes", self.max_line))
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}
