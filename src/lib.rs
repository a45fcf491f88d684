//! # Volume Bridge
//!
//! Client side of a remote volume mixer: a single controller API for
//! per-device and per-application volume that talks either to an in-process
//! native channel or to a volume server over a WebSocket.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              MIXER CLIENT                                 │
//! │                                                                           │
//! │   UI action ──▶ DebouncedController (controller::debounced)               │
//! │                   │  coalesce bursts, fan one result out to all callers   │
//! │                   ▼                                                       │
//! │            ┌──────────── Backend selector (controller::select) ────────┐  │
//! │            ▼                                                           ▼  │
//! │   NativeController                                     SocketController   │
//! │   (controller::native)                                (controller::socket)│
//! │     │ invoke("device_get_volume", {id})                  │                │
//! │     │                                                    ▼                │
//! │     │                                   RequestCorrelator (request_id)    │
//! │     │                                                    │                │
//! │     │                                                    ▼                │
//! │     │                                   ConnectSocket (network::socket)   │
//! │     │                                     send / listeners / heartbeat    │
//! │     │                                                    │                │
//! └─────┼────────────────────────────────────────────────────┼────────────────┘
//!       │ in-process                                         │ ws:// text frames
//!       ▼                                                    ▼
//! ┌───────────────┐                               ┌──────────────────────────┐
//! │  Host backend │                               │   Remote volume server   │
//! └───────────────┘                               └────────────┬─────────────┘
//!                                                              │ {"event":"update"}
//!                                                              ▼
//!                         UpdateHub (updates) ──▶ MixerState (state) / UI
//! ```
//!
//! [`session::Session`] drives the connection state machine on top of the
//! selected controller: retrying connects, periodic heartbeats and the forced
//! logout once the server stops answering. [`bridge::Bridge`] wires all of it
//! together as one explicitly owned context.

pub mod bridge;
pub mod config;
pub mod controller;
pub mod debounce;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;
pub mod state;
pub mod updates;

pub use bridge::Bridge;
pub use controller::{VolumeController, VolumeControllerExt};
pub use error::{Error, Result};
pub use protocol::{
    AppIdentifier, AudioApplication, AudioDevice, DeviceIdentifier, ServerAddress, UpdateChange,
    VolumePercent,
};

/// Application-wide constants
pub mod constants {
    /// Default port of the volume server's WebSocket
    pub const DEFAULT_PORT: u16 = 9002;

    /// Lowest accepted server port (inclusive)
    pub const MIN_PORT: u16 = 1024;

    /// Upper bound of accepted server ports (exclusive)
    pub const MAX_PORT: u32 = 65536;

    /// Default server host
    pub const DEFAULT_HOST: &str = "127.0.0.1";

    /// Name of the server-pushed update event
    pub const UPDATE_EVENT: &str = "update";

    /// Correlated request timeout in milliseconds
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2500;

    /// How long a heartbeat waits for its pong
    pub const HEARTBEAT_WAIT_MS: u64 = 2000;

    /// Delay between heartbeats
    pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

    /// Consecutive heartbeat misses tolerated before a forced logout
    pub const MAX_HEARTBEAT_RETRIES: u32 = 3;

    /// Connection attempts made by the initial connect
    pub const CONNECT_ATTEMPTS: u32 = 5;

    /// Delay between connection attempts
    pub const RETRY_DELAY_MS: u64 = 1000;

    /// Timeout of a single WebSocket handshake
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Debounce delay classes in milliseconds
    pub const DEBOUNCE_NORMAL_MS: u64 = 100;
    pub const DEBOUNCE_SLOW_MS: u64 = 200;
    pub const DEBOUNCE_FAST_MS: u64 = 70;
    pub const DEBOUNCE_SUPER_FAST_MS: u64 = 50;

    /// UDP port the server's discovery responder listens on
    pub const DISCOVERY_PORT: u16 = 51280;

    /// Discovery probe payload
    pub const DISCOVERY_MESSAGE: &str = "DISCOVER_VOLUMIZE";

    /// Prefix of the discovery reply, followed by the WebSocket port
    pub const DISCOVERY_REPLY_PREFIX: &str = "SERVER:";

    /// How long discovery waits for a reply
    pub const DISCOVERY_TIMEOUT_MS: u64 = 3000;

    /// Capacity of the update broadcast channel
    pub const UPDATE_CHANNEL_CAPACITY: usize = 256;
}
