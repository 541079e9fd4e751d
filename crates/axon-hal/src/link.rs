//! The [`SensorLink`] trait – one physical (or simulated) connection to the
//! sensor board.
//!
//! Links are blocking and owned by exactly one acquisition loop.  They decode
//! firmware lines into untimestamped [`SensorReading`]s; stamping happens in
//! the loop so that the session clock is the single source of time.

use axon_types::{LinkError, SampleSource, SensorReading};

pub trait SensorLink: Send {
    /// Short human-readable identity used in log fields (port path, "sim").
    fn describe(&self) -> String;

    /// Where readings from this link come from.
    fn source(&self) -> SampleSource;

    /// Open (or re-open) the underlying handle.
    fn open(&mut self) -> Result<(), LinkError>;

    /// Block until one frame is decoded, the read times out, or the link
    /// fails.
    ///
    /// - [`LinkError::Timeout`] – nothing complete arrived within the read
    ///   timeout; the link may still be healthy.
    /// - [`LinkError::Malformed`] – one line was garbage; keep reading.
    /// - [`LinkError::Disconnected`] – the handle is unusable until re-opened.
    fn read_frame(&mut self) -> Result<SensorReading, LinkError>;

    /// Write one command line to the device.
    fn write_command(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Release the underlying handle.  Idempotent.
    fn close(&mut self);
}

impl<L: SensorLink + ?Sized> SensorLink for Box<L> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn source(&self) -> SampleSource {
        (**self).source()
    }

    fn open(&mut self) -> Result<(), LinkError> {
        (**self).open()
    }

    fn read_frame(&mut self) -> Result<SensorReading, LinkError> {
        (**self).read_frame()
    }

    fn write_command(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        (**self).write_command(bytes)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
