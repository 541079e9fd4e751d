//! `axon-bridge` – one sensor stream out to many TCP clients, many command
//! streams back in to one link.
//!
//! - [`server`] – [`BridgeServer`]: accepts clients, assigns sequence numbers
//!   in a single broadcast stage, fans frames out through per-client
//!   drop-oldest queues, and forwards plus echoes inbound commands.
//! - [`client`] – [`BridgeClient`]: the remote side, with the same
//!   reconnect-and-heartbeat behaviour as the serial acquisition loop.
//! - [`queue`] – [`OutboundQueue`]: bounded drop-oldest frame buffer.
//! - [`lines`] – [`LineReader`]: length-limited, cancel-safe line reader.

pub mod client;
pub mod lines;
pub mod queue;
pub mod server;

pub use client::{BridgeClient, BridgeClientConfig, BridgeClientHandle, BridgeEvent, ClientState};
pub use lines::{LineEvent, LineReader};
pub use queue::{OutboundQueue, PushOutcome};
pub use server::{
    BridgeHandle, BridgeIngest, BridgeServer, BridgeServerConfig, ClientStats, ConnectionState,
    DEFAULT_PORT, LOCAL_CLIENT_ID,
};
