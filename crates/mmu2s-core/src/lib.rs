//! # MMU2S Core Library
//!
//! Host-side driver for the Prusa MMU2S multi-material unit attached over
//! USB serial.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Port discovery through udev symlinks, including bootloader detection
//! - A serialised command/acknowledgement engine over the MMU line protocol
//! - Polling of the Finda sensor with debounced runout events
//! - Device lifecycle (reset, connect, teardown) and firmware flashing handoff
//!
//! ## Example
//!
//! ```rust,ignore
//! use mmu2s_core::{config::Mmu2sConfig, device::{HostServices, Mmu2s}};
//!
//! let config = Mmu2sConfig::from_file("mmu2s.json")?;
//! let mmu = Mmu2s::new(config, host_services)?;
//!
//! // Printer is up: pulse reset, connect after the grace period
//! mmu.handle_ready();
//!
//! // Later, once the MMU sent its handshake
//! println!("{}", mmu.get_status().await?);
//! ```

pub mod config;
pub mod device;
pub mod firmware;
pub mod host;
pub mod idler;
pub mod protocol;
pub mod sensor;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Mmu2sConfig;
    pub use crate::device::{HostServices, Mmu2s};
    pub use crate::firmware::{FlashRunner, ProcessFlashRunner};
    pub use crate::host::{Buttons, DigitalOut, Printer, RunoutReaction};
    pub use crate::protocol::{
        CommandEngine, Connection, ConnectionState, MmuCommand, MmuError, PortLocator,
        SerialPortOpener,
    };
    pub use crate::sensor::FindaSensor;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
