//! Connection management
//!
//! Owns the serial channel to the MMU: locating the port, waiting for the
//! application firmware, opening with a bounded retry budget, and a reader
//! task that frames inbound bytes into lines.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    codec::LineBuffer,
    port::{BoxedPort, FirmwareIdentity, PortLocator, PortOpener},
    MmuError, DEFAULT_BAUD_RATE,
};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No channel open
    Disconnected,
    /// Autodetecting the port
    Locating,
    /// Waiting for the device to enumerate, then opening the port
    Connecting,
    /// Bootloader seen; waiting for it to hand over to the application
    AwaitingApplicationFirmware,
    /// Channel open and reader running
    Connected,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Serial port; `None` autodetects through the locator
    pub port: Option<PathBuf>,
    /// Baud rate
    pub baud_rate: u32,
    /// udev symlink directories
    pub locator: PortLocator,
    /// How long to wait for the application firmware to enumerate
    pub identity_wait: Duration,
    /// Interval between identity checks
    pub identity_poll_interval: Duration,
    /// Total budget for opening the port
    pub open_budget: Duration,
    /// Pause after a failed open
    pub open_retry_delay: Duration,
    /// Bytes requested per read
    pub read_chunk: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            locator: PortLocator::default(),
            identity_wait: Duration::from_secs(10),
            identity_poll_interval: Duration::from_millis(100),
            open_budget: Duration::from_secs(90),
            open_retry_delay: Duration::from_secs(5),
            read_chunk: 64,
        }
    }
}

/// Receives what the reader task produces
pub trait InboundSink: Send + Sync {
    /// A complete line arrived (without its terminator)
    fn on_line(&self, line: String);

    /// The channel was torn down
    fn on_disconnect(&self);
}

/// An open channel
struct Session {
    id: u64,
    writer: Arc<tokio::sync::Mutex<WriteHalf<BoxedPort>>>,
    cancel: CancellationToken,
    _reader: JoinHandle<()>,
}

struct Inner {
    config: ConnectionConfig,
    opener: Arc<dyn PortOpener>,
    sink: Arc<dyn InboundSink>,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<Session>>,
    port: Mutex<Option<PathBuf>>,
    /// Bumped by every teardown so an in-progress connect can tell it was
    /// superseded
    epoch: AtomicU64,
    next_session: AtomicU64,
    /// Held for a whole connect attempt; a second caller waits and then
    /// finds the channel open
    connecting: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serial connection to the MMU
///
/// Cheap to clone; all clones share one channel.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("port", &self.port())
            .finish()
    }
}

impl Connection {
    /// Create a new connection (not yet connected)
    pub fn new(
        config: ConnectionConfig,
        opener: Arc<dyn PortOpener>,
        sink: Arc<dyn InboundSink>,
    ) -> Self {
        let port = config.port.clone();
        Self {
            inner: Arc::new(Inner {
                config,
                opener,
                sink,
                state: Mutex::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                port: Mutex::new(port),
                epoch: AtomicU64::new(0),
                next_session: AtomicU64::new(1),
                connecting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// Check if the channel is open
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// True when the port is found by autodetect rather than configured
    pub fn is_autodetect(&self) -> bool {
        self.inner.config.port.is_none()
    }

    /// Port resolved by the last connect attempt (or the configured one)
    pub fn port(&self) -> Option<PathBuf> {
        lock(&self.inner.port).clone()
    }

    /// Symlink locator used for identity checks
    pub fn locator(&self) -> &PortLocator {
        &self.inner.config.locator
    }

    fn set_state(&self, state: ConnectionState) {
        let mut guard = lock(&self.inner.state);
        if *guard != state {
            debug!("mmu2s: connection {:?} -> {:?}", *guard, state);
            *guard = state;
        }
    }

    /// Connect to the MMU
    ///
    /// Runs one full attempt: locate, wait for the application firmware,
    /// open. Any failure leaves the connection `Disconnected`.
    ///
    /// Concurrent calls are serialised: a caller arriving during an attempt
    /// waits for it and returns `Ok` if it succeeded.
    pub async fn connect(&self) -> Result<(), MmuError> {
        let _attempt = self.inner.connecting.lock().await;
        if self.is_connected() {
            debug!("mmu2s: connect requested while already connected");
            return Ok(());
        }

        info!("Starting MMU2S connect");
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        match self.try_connect(epoch).await {
            Ok(()) => {
                info!("MMU2S connected");
                Ok(())
            }
            Err(e) => {
                if self.inner.epoch.load(Ordering::SeqCst) == epoch {
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    async fn try_connect(&self, epoch: u64) -> Result<(), MmuError> {
        self.set_state(ConnectionState::Locating);
        let port = match &self.inner.config.port {
            Some(port) => port.clone(),
            None => self
                .inner
                .config
                .locator
                .autodetect()?
                .ok_or(MmuError::PortNotFound)?,
        };
        *lock(&self.inner.port) = Some(port.clone());

        self.set_state(ConnectionState::Connecting);
        self.wait_for_program(&port).await?;

        let stream = self.open_with_retry(&port).await?;

        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            // Torn down while we were connecting; drop the fresh handle
            return Err(MmuError::Disconnected("connect".to_string()));
        }
        self.attach(stream);
        Ok(())
    }

    /// Wait until the application firmware owns the port.
    ///
    /// A bootloader identity is expected right after a reset and is waited
    /// out; only an exhausted budget is a failure.
    async fn wait_for_program(&self, port: &Path) -> Result<(), MmuError> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.identity_wait;
        let mut logged = false;

        loop {
            match config.locator.resolve_identity(port)? {
                FirmwareIdentity::Application => {
                    info!("mmu2s: Device found on {}", port.display());
                    return Ok(());
                }
                FirmwareIdentity::Bootloader => {
                    if !logged {
                        info!("mmu2s: Waiting to exit bootloader");
                        logged = true;
                    }
                    self.set_state(ConnectionState::AwaitingApplicationFirmware);
                }
                FirmwareIdentity::Unknown => {}
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(config.identity_poll_interval).await;
        }

        info!("mmu2s: No device detected");
        Err(MmuError::DeviceNotFound(port.to_path_buf()))
    }

    async fn open_with_retry(&self, port: &Path) -> Result<BoxedPort, MmuError> {
        let config = &self.inner.config;
        let start = Instant::now();

        loop {
            if start.elapsed() > config.open_budget {
                return Err(MmuError::ConnectTimeout(port.to_path_buf()));
            }
            match self.inner.opener.open(port, config.baud_rate) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!("Unable to open MMU2S port {}: {}", port.display(), e);
                    tokio::time::sleep(config.open_retry_delay).await;
                }
            }
        }
    }

    fn attach(&self, stream: BoxedPort) {
        let (reader, writer) = tokio::io::split(stream);
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(read_loop(
            self.inner.clone(),
            id,
            reader,
            cancel.clone(),
        ));

        let replaced = lock(&self.inner.session).replace(Session {
            id,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            cancel,
            _reader: handle,
        });
        if let Some(old) = replaced {
            warn!("mmu2s: replacing open session {}", old.id);
            old.cancel.cancel();
        }
        self.set_state(ConnectionState::Connected);
    }

    /// Tear down the channel
    ///
    /// Idempotent; always ends `Disconnected`.
    pub fn disconnect(&self) {
        self.inner.teardown(None);
    }

    /// Write one line, appending the terminator
    ///
    /// A write failure tears the connection down.
    pub async fn write_line(&self, line: &str) -> Result<(), MmuError> {
        let (id, writer) = lock(&self.inner.session)
            .as_ref()
            .map(|s| (s.id, s.writer.clone()))
            .ok_or_else(|| MmuError::Disconnected(line.to_string()))?;

        debug!("mmu2s >> {}", line);
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');

        let result = {
            let mut writer = writer.lock().await;
            match writer.write_all(&data).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = result {
            warn!("MMU2S disconnected: write failed: {}", e);
            self.inner.teardown(Some(id));
            return Err(MmuError::ChannelIo(e));
        }
        Ok(())
    }
}

impl Inner {
    /// Close the current session. With `only`, a stale reader cannot close a
    /// newer session.
    fn teardown(&self, only: Option<u64>) {
        let session = {
            let mut guard = lock(&self.session);
            if let Some(id) = only {
                if guard.as_ref().map(|s| s.id) != Some(id) {
                    return;
                }
            }
            guard.take()
        };

        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = session {
            session.cancel.cancel();
            info!("MMU2S disconnected");
        }
        *lock(&self.state) = ConnectionState::Disconnected;
        self.sink.on_disconnect();
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    id: u64,
    mut reader: ReadHalf<BoxedPort>,
    cancel: CancellationToken,
) {
    let mut lines = LineBuffer::new();
    let mut buf = vec![0u8; inner.config.read_chunk.max(1)];

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = reader.read(&mut buf) => result,
        };

        match result {
            Ok(0) => {
                warn!("MMU2S disconnected: end of stream");
                inner.teardown(Some(id));
                return;
            }
            Ok(n) => {
                for line in lines.feed(&buf[..n]) {
                    if cancel.is_cancelled() {
                        return;
                    }
                    inner.sink.on_line(line);
                }
            }
            Err(e) => {
                warn!("MMU2S disconnected\n{}", e);
                inner.teardown(Some(id));
                return;
            }
        }
    }
}
