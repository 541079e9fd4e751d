//! # axon-hal
//!
//! Hardware Abstraction Layer for the Axon sensor board.
//!
//! Everything that touches the physical link lives here: the line-framed
//! firmware protocol, the serial and simulated links, and the acquisition
//! loop that turns an unreliable link into an infinite, strictly-timestamped
//! sample stream.
//!
//! | Module | Role |
//! |---|---|
//! | [`frame`] | Firmware line decoding (`LineDecoder`, checksum, JSON payload) |
//! | [`link`] | [`SensorLink`] trait implemented by every link backend |
//! | [`serial`] | [`SerialLink`] over a real serial port |
//! | [`sim`] | [`SimLink`] deterministic generator for CI and demos |
//! | [`acquisition`] | [`AcquisitionLoop`] with reconnect, heartbeats and commands |

pub mod acquisition;
pub mod frame;
pub mod link;
pub mod serial;
pub mod sim;

pub use acquisition::{
    AcquisitionConfig, AcquisitionHandle, AcquisitionLoop, LinkState, LinkStats,
    LinkStatsSnapshot, spawn_acquisition,
};
pub use frame::LineDecoder;
pub use link::SensorLink;
pub use serial::{SerialConfig, SerialLink};
pub use sim::{SimConfig, SimLink};
