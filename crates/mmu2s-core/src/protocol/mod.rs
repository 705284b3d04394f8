//! Serial Protocol Communication
//!
//! Implements the MMU2S line protocol: ASCII commands (a letter plus an
//! integer), acknowledged by a line containing `ok`. Anything else the MMU
//! sends is an unsolicited transfer.

pub mod codec;
pub mod commands;
mod connection;
pub mod engine;
mod error;
pub mod port;

pub use codec::LineBuffer;
pub use commands::{CommandTimeouts, MmuCommand, TimeoutClass};
pub use connection::{Connection, ConnectionConfig, ConnectionState, InboundSink};
pub use engine::{classify, strip_ack, CommandEngine, Inbound};
pub use error::MmuError;
pub use port::{
    BoxedPort, FirmwareIdentity, PortLocator, PortOpener, SerialIo, SerialPortOpener,
};

/// Baud rate of the MMU2S USB CDC interface
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Substring marking an acknowledgement line
pub const ACK_MARKER: &str = "ok";

/// Default timeout for commands that move hardware
pub const RESPONSE_TIMEOUT_SECS: f64 = 45.0;

/// Timeout for probe commands (Finda read)
pub const PROBE_TIMEOUT_SECS: f64 = 3.0;

/// Retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 2;
