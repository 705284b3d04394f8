//! Command/acknowledgement exchange
//!
//! The MMU protocol has no message IDs. Correlation relies on there being at
//! most one outstanding command: the next line containing [`ACK_MARKER`] is
//! its acknowledgement, every other line is a transfer initiated by the MMU.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    connection::{Connection, ConnectionConfig, ConnectionState, InboundSink},
    port::PortOpener,
    MmuError, ACK_MARKER,
};
use crate::host::Printer;

/// How often a long wait reports the remaining time
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Kind of an inbound line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Acknowledges the outstanding command
    Ack(String),
    /// Initiated by the MMU
    Event(String),
}

/// Classify an inbound line
pub fn classify(line: String) -> Inbound {
    if line.contains(ACK_MARKER) {
        Inbound::Ack(line)
    } else {
        Inbound::Event(line)
    }
}

/// Strip the terminator and trailing acknowledgement marker, leaving the
/// payload (e.g. `"302ok\r"` -> `"302"`).
pub fn strip_ack(raw: &str) -> String {
    let trimmed = raw.trim_end_matches(['\r', '\n']);
    trimmed
        .strip_suffix(ACK_MARKER)
        .unwrap_or(trimmed)
        .to_string()
}

/// Leading integer of an acknowledgement payload
pub fn parse_leading_int(payload: &str) -> Option<i64> {
    let payload = payload.trim_start();
    let end = payload
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(payload.len());
    payload[..end].parse().ok()
}

/// The single pending-acknowledgement slot, filled by the reader task and
/// drained by the sender.
#[derive(Debug, Default)]
struct AckSlot {
    response: Mutex<Option<String>>,
    acks_since_send: AtomicUsize,
    wake: Notify,
}

impl AckSlot {
    /// Store an acknowledgement and wake the sender. Returns how many
    /// acknowledgements arrived since the last write.
    fn fulfill(&self, line: String) -> usize {
        *self.response.lock().unwrap_or_else(PoisonError::into_inner) = Some(line);
        let count = self.acks_since_send.fetch_add(1, Ordering::SeqCst) + 1;
        self.wake.notify_one();
        count
    }

    fn take(&self) -> Option<String> {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn arm(&self) {
        self.acks_since_send.store(0, Ordering::SeqCst);
    }
}

/// Routes reader output: acknowledgements to the slot, everything else to
/// the event channel.
struct Router {
    slot: Arc<AckSlot>,
    events: mpsc::UnboundedSender<String>,
}

impl InboundSink for Router {
    fn on_line(&self, line: String) {
        debug!("mmu2s << {}", line);
        match classify(line) {
            Inbound::Ack(line) => {
                if self.slot.fulfill(line) > 1 {
                    warn!("mmu2s: multiple acknowledgements recd");
                }
            }
            Inbound::Event(line) => {
                if self.events.send(line).is_err() {
                    debug!("mmu2s: transfer dropped, no event listener");
                }
            }
        }
    }

    fn on_disconnect(&self) {
        self.slot.wake.notify_one();
    }
}

enum WaitOutcome {
    Ack(String),
    Disconnected,
    TimedOut,
}

/// Serialised command sender
///
/// Owns the [`Connection`]. `send` holds an async mutex for its whole
/// exchange, so commands from the sensor poll and from the user never
/// interleave on the wire.
pub struct CommandEngine {
    connection: Connection,
    slot: Arc<AckSlot>,
    lock: tokio::sync::Mutex<()>,
    printer: Arc<dyn Printer>,
}

impl std::fmt::Debug for CommandEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEngine")
            .field("connection", &self.connection)
            .finish()
    }
}

impl CommandEngine {
    /// Create an engine and the receiver for MMU-initiated lines
    pub fn new(
        config: ConnectionConfig,
        opener: Arc<dyn PortOpener>,
        printer: Arc<dyn Printer>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let slot = Arc::new(AckSlot::default());
        let (events, rx) = mpsc::unbounded_channel();
        let router = Arc::new(Router {
            slot: slot.clone(),
            events,
        });
        let engine = Self {
            connection: Connection::new(config, opener, router),
            slot,
            lock: tokio::sync::Mutex::new(()),
            printer,
        };
        (engine, rx)
    }

    /// The underlying connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Connect to the MMU
    pub async fn connect(&self) -> Result<(), MmuError> {
        self.connection.connect().await
    }

    /// Tear down the connection; a waiting `send` fails immediately
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.connection.state() == ConnectionState::Connected
    }

    /// Send `line` and wait for its acknowledgement.
    ///
    /// Makes `retries + 1` attempts, each waiting up to `timeout`. Returns
    /// the acknowledgement payload (see [`strip_ack`]). A disconnect during
    /// the wait fails at once without using up the remaining attempts.
    pub async fn send(
        &self,
        line: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<String, MmuError> {
        let _guard = self.lock.lock().await;

        if !self.is_connected() {
            return Err(MmuError::Disconnected(line.to_string()));
        }
        self.slot.take();

        let mut attempts = retries.saturating_add(1);
        while attempts > 0 {
            attempts -= 1;
            self.slot.arm();

            // A failed write has already torn the connection down; the wait
            // below reports it.
            if let Err(e) = self.connection.write_line(line).await {
                debug!("mmu2s: write of {} failed: {}", line, e);
            }

            match self.wait_for_ack(timeout).await {
                WaitOutcome::Ack(raw) => return Ok(strip_ack(&raw)),
                WaitOutcome::Disconnected => {
                    return Err(MmuError::Disconnected(line.to_string()))
                }
                WaitOutcome::TimedOut => {}
            }

            if attempts > 0 {
                self.printer
                    .respond_info(&format!("mmu2s: retrying command {}", line));
            }
        }

        Err(MmuError::ProtocolTimeout(line.to_string()))
    }

    async fn wait_for_ack(&self, timeout: Duration) -> WaitOutcome {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut next_notice = start + PROGRESS_INTERVAL;

        loop {
            if let Some(raw) = self.slot.take() {
                return WaitOutcome::Ack(raw);
            }
            if !self.is_connected() {
                return WaitOutcome::Disconnected;
            }

            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            if now >= next_notice {
                self.printer.respond_info(&format!(
                    "mmu2s: waiting for response, {:.2}s remaining",
                    (deadline - now).as_secs_f64()
                ));
                next_notice = now + PROGRESS_INTERVAL;
            }

            tokio::select! {
                _ = self.slot.wake.notified() => {}
                _ = tokio::time::sleep_until(deadline.min(next_notice)) => {}
            }
        }
    }
}
