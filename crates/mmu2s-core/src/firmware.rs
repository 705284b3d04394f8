//! Firmware flashing handoff
//!
//! The MMU is flashed by an external tool (avrdude) while its bootloader
//! owns the port. This module validates the request, builds the tool's
//! command line and streams the tool's output back line by line.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Mmu2sConfig;
use crate::protocol::MmuError;

/// Combined stdout/stderr of the flashing tool, one line per item
pub type OutputLines = mpsc::UnboundedReceiver<String>;

/// Runs the external flashing tool
pub trait FlashRunner: Send + Sync {
    /// Start `program` with `args` and return its output stream
    fn run(&self, program: &str, args: &[String]) -> Result<OutputLines, MmuError>;
}

/// Spawns the tool as a child process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessFlashRunner;

impl FlashRunner for ProcessFlashRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<OutputLines, MmuError> {
        info!("mmu2s: running {} {}", program, args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| MmuError::Firmware(format!("failed to start {}: {}", program, e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        let program = program.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => info!("mmu2s: {} finished", program),
                Ok(status) => warn!("mmu2s: {} exited with {}", program, status),
                Err(e) => warn!("mmu2s: waiting for {} failed: {}", program, e),
            }
        });

        Ok(rx)
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("mmu2s: error reading flash tool output: {}", e);
                return;
            }
        }
    }
}

/// Validate a firmware path given by the user.
///
/// The name must end in `hex` and the file must exist. A leading `~` or
/// `~/` is expanded from `$HOME`; `~user` is rejected.
pub fn resolve_firmware_path(file: &str) -> Result<PathBuf, MmuError> {
    if !file.ends_with("hex") {
        return Err(MmuError::Firmware(format!(
            "File does not appear to be a valid hex: {}",
            file
        )));
    }

    let path = match file.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            let home = std::env::var_os("HOME").ok_or_else(|| {
                MmuError::Firmware(format!("cannot expand {}: HOME is not set", file))
            })?;
            PathBuf::from(home).join(rest.trim_start_matches('/'))
        }
        // `~user` lookups are not supported
        Some(_) => {
            return Err(MmuError::Firmware(format!(
                "cannot expand {}: only ~ and ~/ are supported",
                file
            )));
        }
        None => PathBuf::from(file),
    };

    if !path.exists() {
        return Err(MmuError::Firmware(format!(
            "Cannot find firmware file: {}",
            path.display()
        )));
    }
    Ok(path)
}

/// Command line for the flashing tool
pub fn flash_args(config: &Mmu2sConfig, tty: &Path, firmware: &Path) -> Vec<String> {
    vec![
        "-p".to_string(),
        config.flash_part.clone(),
        "-c".to_string(),
        config.flash_programmer.clone(),
        "-P".to_string(),
        tty.display().to_string(),
        "-D".to_string(),
        "-U".to_string(),
        format!("flash:w:{}:i", firmware.display()),
    ]
}
