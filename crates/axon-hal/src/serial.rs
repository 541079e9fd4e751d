//! [`SerialLink`] – the sensor board on a real serial port.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use axon_types::{LinkError, SampleSource, SensorReading};
use serialport::SerialPort;
use tracing::debug;

use crate::frame::{LineDecoder, MAX_LINE_BYTES};
use crate::link::SensorLink;

/// Default baud rate of the Axon firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    /// Upper bound on one blocking read.
    pub read_timeout: Duration,
    pub max_line_bytes: usize,
}

impl SerialConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_millis(50),
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

pub struct SerialLink {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
    decoder: LineDecoder,
    pending: VecDeque<Result<SensorReading, LinkError>>,
}

impl SerialLink {
    pub fn new(config: SerialConfig) -> Self {
        let decoder = LineDecoder::with_max_line(config.max_line_bytes);
        Self {
            config,
            port: None,
            decoder,
            pending: VecDeque::new(),
        }
    }

    /// Names of the serial ports the OS currently reports.
    pub fn available_ports() -> Vec<String> {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .unwrap_or_default()
    }
}

impl SensorLink for SerialLink {
    fn describe(&self) -> String {
        format!("{}@{}", self.config.path, self.config.baud_rate)
    }

    fn source(&self) -> SampleSource {
        SampleSource::Hardware
    }

    fn open(&mut self) -> Result<(), LinkError> {
        self.close();
        let port = serialport::new(&self.config.path, self.config.baud_rate)
            .timeout(self.config.read_timeout)
            .open()
            .map_err(|e| {
                LinkError::Disconnected(format!("cannot open {}: {e}", self.config.path))
            })?;
        debug!(port = %self.config.path, baud = self.config.baud_rate, "serial port opened");
        self.port = Some(port);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<SensorReading, LinkError> {
        let mut buf = [0u8; 256];
        loop {
            if let Some(result) = self.pending.pop_front() {
                return result;
            }
            let port = self
                .port
                .as_mut()
                .ok_or_else(|| LinkError::Disconnected("serial port not open".to_string()))?;

            match port.read(&mut buf) {
                Ok(0) => {
                    return Err(LinkError::Disconnected(
                        "serial port reported end of stream".to_string(),
                    ));
                }
                Ok(n) => self.pending.extend(self.decoder.push(&buf[..n])),
                Err(e) if e.kind() == ErrorKind::TimedOut => return Err(LinkError::Timeout),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(LinkError::Disconnected(e.to_string())),
            }
        }
    }

    fn write_command(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| LinkError::Disconnected("serial port not open".to_string()))?;
        let mut line = bytes.to_vec();
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }
        port.write_all(&line)
            .and_then(|_| port.flush())
            .map_err(|e| match e.kind() {
                ErrorKind::TimedOut => LinkError::Timeout,
                _ => LinkError::Disconnected(e.to_string()),
            })
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.config.path, "serial port closed");
        }
        self.decoder.reset();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_firmware() {
        let config = SerialConfig::new("/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.read_timeout, Duration::from_millis(50));

        let config = config.with_baud_rate(9600);
        assert_eq!(config.baud_rate, 9600);
    }

    #[test]
    fn unopened_link_is_disconnected() {
        let mut link = SerialLink::new(SerialConfig::new("/dev/does-not-exist"));
        assert!(matches!(link.read_frame(), Err(LinkError::Disconnected(_))));
        assert!(matches!(
            link.write_command(b"LED ON"),
            Err(LinkError::Disconnected(_))
        ));
        assert!(matches!(link.open(), Err(LinkError::Disconnected(_))));
        assert_eq!(link.source(), SampleSource::Hardware);
    }
}
