//! Serial port handling
//!
//! Locates the MMU through the udev `by-id`/`by-path` symlink directories and
//! opens the port with the settings the MMU firmware expects.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;

/// Substring present in every MMU2 USB identity
pub const DEVICE_FAMILY_MARKER: &str = "Multi_Material";

/// Substring identifying the MMU2 application firmware, used for autodetect
pub const DEVICE_MODEL_MARKER: &str = "MK3_Multi_Material_2.0";

/// Substring present in the identity while the Caterina bootloader runs
pub const BOOTLOADER_MARKER: &str = "bootloader";

/// Default udev directory of identity symlinks
pub const DEFAULT_BY_ID_DIR: &str = "/dev/serial/by-id";

/// Default udev directory of physical-path symlinks
pub const DEFAULT_BY_PATH_DIR: &str = "/dev/serial/by-path";

/// Which firmware currently owns the USB endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareIdentity {
    /// Normal MMU firmware, ready for commands
    Application,
    /// Bootloader, ready for flashing
    Bootloader,
    /// No identity link resolves to the port (absent or not enumerated yet)
    Unknown,
}

/// Finds the MMU among the udev serial symlinks
#[derive(Debug, Clone)]
pub struct PortLocator {
    by_id: PathBuf,
    by_path: PathBuf,
}

impl Default for PortLocator {
    fn default() -> Self {
        Self::new(DEFAULT_BY_ID_DIR, DEFAULT_BY_PATH_DIR)
    }
}

impl PortLocator {
    /// Create a locator over the given `by-id` and `by-path` directories
    pub fn new(by_id: impl Into<PathBuf>, by_path: impl Into<PathBuf>) -> Self {
        Self {
            by_id: by_id.into(),
            by_path: by_path.into(),
        }
    }

    /// Determine which firmware is behind `target`.
    ///
    /// Missing directories and a target that does not exist yet both mean
    /// the device has not enumerated, so they report `Unknown`.
    pub fn resolve_identity(&self, target: &Path) -> io::Result<FirmwareIdentity> {
        let Some(tty) = canonicalize_if_present(target)? else {
            return Ok(FirmwareIdentity::Unknown);
        };

        for link in list_links(&self.by_id)? {
            let name = link_name(&link);
            if !name.contains(DEVICE_FAMILY_MARKER) {
                continue;
            }
            if canonicalize_if_present(&link)?.as_deref() == Some(tty.as_path()) {
                return Ok(if name.contains(BOOTLOADER_MARKER) {
                    FirmwareIdentity::Bootloader
                } else {
                    FirmwareIdentity::Application
                });
            }
        }
        Ok(FirmwareIdentity::Unknown)
    }

    /// Find the MMU and return its `by-path` name, which survives USB
    /// re-enumeration (the bootloader and the application firmware get
    /// different `by-id` names and tty numbers).
    ///
    /// Not reliable with more than one MMU attached.
    pub fn autodetect(&self) -> io::Result<Option<PathBuf>> {
        for link in list_links(&self.by_id)? {
            if !link_name(&link).contains(DEVICE_MODEL_MARKER) {
                continue;
            }
            let Some(real) = canonicalize_if_present(&link)? else {
                continue;
            };
            for candidate in list_links(&self.by_path)? {
                if canonicalize_if_present(&candidate)?.as_deref() == Some(real.as_path()) {
                    return Ok(Some(candidate));
                }
            }
        }
        Ok(None)
    }
}

/// Entries of a symlink directory, sorted so lookups are deterministic
fn list_links(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut links = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()?;
    links.sort();
    Ok(links)
}

fn link_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Real path of `path`, or `None` if it (or its link target) does not exist
fn canonicalize_if_present(path: &Path) -> io::Result<Option<PathBuf>> {
    match fs::canonicalize(path) {
        Ok(real) => Ok(Some(real)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Byte channel to the MMU
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialIo for T {}

/// Boxed channel handed out by a [`PortOpener`]
pub type BoxedPort = Box<dyn SerialIo>;

/// Opens the channel to the MMU
///
/// The connection manager only talks to this trait so tests can substitute
/// an in-memory pipe for the tty.
pub trait PortOpener: Send + Sync {
    /// Open `path` at `baud_rate`
    fn open(&self, path: &Path, baud_rate: u32) -> io::Result<BoxedPort>;
}

/// Opens a real tty through `tokio-serial`
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortOpener;

impl PortOpener for SerialPortOpener {
    fn open(&self, path: &Path, baud_rate: u32) -> io::Result<BoxedPort> {
        // 8N2, no flow control. The MMU firmware expects two stop bits.
        #[allow(unused_mut)]
        let mut stream = serialport::new(path.to_string_lossy(), baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::Two)
            .flow_control(serialport::FlowControl::None)
            .open_native_async()?;

        #[cfg(unix)]
        stream.set_exclusive(true)?;

        Ok(Box::new(stream))
    }
}
