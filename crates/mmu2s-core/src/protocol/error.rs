//! Protocol errors

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while talking to the MMU
#[derive(Error, Debug)]
pub enum MmuError {
    #[error("mmu2s: Unable to autodetect serial port for MMU device")]
    PortNotFound,

    #[error("mmu2s: unable to find mmu2s device on {}", .0.display())]
    DeviceNotFound(PathBuf),

    #[error("mmu2s: Unable to connect to MMU2s on {}", .0.display())]
    ConnectTimeout(PathBuf),

    #[error("mmu2s: channel I/O error: {0}")]
    ChannelIo(#[from] std::io::Error),

    #[error("mmu2s: no acknowledgment for command {0}")]
    ProtocolTimeout(String),

    #[error("mmu2s: mmu disconnected, cannot send command {0}")]
    Disconnected(String),

    #[error("mmu2s: Unknown MMU Command {0}")]
    InvalidCommand(String),

    #[error("mmu2s: invalid argument: {0}")]
    InvalidArgument(String),

    #[error("mmu2s: {0}")]
    Firmware(String),

    #[error("mmu2s: configuration error: {0}")]
    Config(String),
}

impl MmuError {
    /// True for failures that mean the link is gone rather than the command
    /// was rejected or went unanswered.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, MmuError::Disconnected(_) | MmuError::ChannelIo(_))
    }
}
