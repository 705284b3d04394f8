//! MMU2S device
//!
//! Ties the command engine, the Finda poll and the idler sensor to the
//! printer lifecycle: reset and connect on ready, tear down on disconnect or
//! restart, and handle the MMU's `start` handshake.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Mmu2sConfig;
use crate::firmware::{flash_args, resolve_firmware_path, FlashRunner};
use crate::host::{Buttons, DigitalOut, Printer, RunoutScript};
use crate::idler::IdlerSensor;
use crate::protocol::engine::parse_leading_int;
use crate::protocol::{
    CommandEngine, CommandTimeouts, FirmwareIdentity, MmuCommand, MmuError, PortOpener,
};
use crate::sensor::{FindaQuery, FindaSensor};

/// Line the MMU sends once its firmware is up
pub const HANDSHAKE: &str = "start";

/// Delay between the reset pulse and the connect attempt
pub const RESET_GRACE: Duration = Duration::from_secs(5);

/// Minimum low time of the reset pulse, in seconds of print time
pub const RESET_PULSE_SECS: f64 = 0.1;

/// Bootloader checks after a reset for flashing
const FLASH_BOOTLOADER_ATTEMPTS: u32 = 5;

/// External services the device needs from the host
pub struct HostServices {
    /// Printer-level services
    pub printer: Arc<dyn Printer>,
    /// MMU reset line
    pub reset_pin: Arc<dyn DigitalOut>,
    /// Button registry for the idler sensor
    pub buttons: Arc<dyn Buttons>,
    /// Opens the serial channel
    pub opener: Arc<dyn PortOpener>,
    /// Runs the firmware flashing tool
    pub flasher: Arc<dyn FlashRunner>,
}

struct Shared {
    config: Mmu2sConfig,
    engine: CommandEngine,
    finda: FindaSensor,
    idler: IdlerSensor,
    printer: Arc<dyn Printer>,
    reset_pin: Arc<dyn DigitalOut>,
    flasher: Arc<dyn FlashRunner>,
    timeouts: CommandTimeouts,
    mmu_ready: AtomicBool,
    reconnect: Mutex<Option<CancellationToken>>,
}

/// MMU2S driver
///
/// Cheap to clone. Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct Mmu2s {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Mmu2s {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmu2s")
            .field("engine", &self.shared.engine)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Mmu2s {
    /// Set up the reset pin and sensors. Does not connect; call
    /// [`Mmu2s::handle_ready`] once the printer is up.
    pub fn new(config: Mmu2sConfig, host: HostServices) -> Result<Self, MmuError> {
        config.validate()?;

        host.reset_pin.setup_max_duration(0.0);
        host.reset_pin.setup_start_value(true, true);

        let (engine, events) =
            CommandEngine::new(config.connection_config(), host.opener, host.printer.clone());
        let reaction = Arc::new(RunoutScript::new(
            host.printer.clone(),
            config.runout_gcode.clone(),
        ));
        let idler = IdlerSensor::new(&config.idler_sensor_pin, host.buttons.as_ref());

        let shared = Arc::new(Shared {
            timeouts: config.timeouts(),
            config,
            engine,
            finda: FindaSensor::new(reaction),
            idler,
            printer: host.printer,
            reset_pin: host.reset_pin,
            flasher: host.flasher,
            mmu_ready: AtomicBool::new(false),
            reconnect: Mutex::new(None),
        });

        tokio::spawn(event_loop(Arc::downgrade(&shared), events));
        Ok(Self { shared })
    }

    /// True once the handshake arrived and the Finda seeded
    pub fn is_ready(&self) -> bool {
        self.shared.mmu_ready.load(Ordering::SeqCst)
    }

    /// Check if the serial channel is open
    pub fn is_connected(&self) -> bool {
        self.shared.engine.is_connected()
    }

    /// The command engine
    pub fn engine(&self) -> &CommandEngine {
        &self.shared.engine
    }

    /// The Finda sensor
    pub fn finda(&self) -> &FindaSensor {
        &self.shared.finda
    }

    /// Printer ready: reset the MMU and connect after the grace period
    pub fn handle_ready(&self) {
        self.shared.hardware_reset();
        self.shared.schedule_connect(RESET_GRACE);
    }

    /// Printer disconnecting
    pub fn handle_disconnect(&self) {
        self.shared.teardown();
    }

    /// Host restart requested
    pub fn handle_restart(&self) {
        self.shared.teardown();
    }

    /// MMU_RESET: tear down, pulse reset and reconnect after the grace period
    pub fn reset(&self) {
        self.shared.teardown();
        self.shared.hardware_reset();
        self.shared.schedule_connect(RESET_GRACE);
    }

    /// Send a command by symbolic name, returning the acknowledgement payload
    pub async fn send_command(&self, name: &str, arg: Option<u32>) -> Result<String, MmuError> {
        let cmd = MmuCommand::from_name(name)?;
        self.shared.ensure_ready(cmd)?;
        self.shared.send(cmd, arg).await
    }

    /// MMU_GET_STATUS report
    pub async fn get_status(&self) -> Result<String, MmuError> {
        let shared = &self.shared;
        shared.ensure_ready(MmuCommand::CheckAck)?;
        let ack = shared.send(MmuCommand::CheckAck, None).await?;
        let version = shared.send(MmuCommand::GetVersion, None).await?;
        let build = shared.send(MmuCommand::GetBuildNumber, None).await?;
        let errors = shared.send(MmuCommand::GetDriveErrors, None).await?;
        Ok(format!(
            "MMU Status:\nAcknowledge Test: {}\nVersion: {}\nBuild Number: {}\nDrive Errors:{}\n",
            ack, version, build, errors
        ))
    }

    /// MMU_SET_STEALTH: 0 normal, 1 stealth
    pub async fn set_stealth(&self, mode: i64) -> Result<(), MmuError> {
        let mode = u32::try_from(mode)
            .ok()
            .filter(|m| *m <= 1)
            .ok_or_else(|| {
                MmuError::InvalidArgument(format!("MODE must be between 0 and 1, got {}", mode))
            })?;
        self.shared.ensure_ready(MmuCommand::SetTmcMode)?;
        self.shared.send(MmuCommand::SetTmcMode, Some(mode)).await?;
        Ok(())
    }

    /// MMU_READ_IR report
    pub fn read_idler(&self) -> String {
        self.shared.idler.report()
    }

    /// Last idler sensor level
    pub fn idler_state(&self) -> bool {
        self.shared.idler.state()
    }

    /// QUERY_FILAMENT_SENSOR SENSOR=finda
    pub fn query_filament_sensor(&self) -> &'static str {
        self.shared.finda.query_message()
    }

    /// SET_FILAMENT_SENSOR SENSOR=finda ENABLE=
    pub fn set_filament_sensor(&self, enable: bool) {
        self.shared.finda.set_enabled(enable);
    }

    /// Dispatch a `T` command. `T0`..`T4` select a tool; `Tx`, `Tc` and
    /// `T?` are accepted and left to the host.
    pub async fn tool_command(&self, command: &str) -> Result<(), MmuError> {
        let upper = command.trim().to_ascii_uppercase();
        let Some(arg) = upper.strip_prefix('T') else {
            return Err(MmuError::InvalidCommand(command.to_string()));
        };
        match arg {
            "X" | "C" | "?" => {
                debug!("mmu2s: {} handled by host", upper);
                Ok(())
            }
            _ => match arg.parse::<u32>() {
                Ok(tool) if tool <= 4 => {
                    self.shared.ensure_ready(MmuCommand::SetTool)?;
                    self.shared.send(MmuCommand::SetTool, Some(tool)).await?;
                    Ok(())
                }
                _ => Err(MmuError::InvalidCommand(command.to_string())),
            },
        }
    }

    /// MMU_FLASH_FIRMWARE: reset into the bootloader and hand over to the
    /// flashing tool, streaming its output to the user.
    ///
    /// The MMU is left disconnected; use [`Mmu2s::reset`] afterwards.
    pub async fn flash_firmware(&self, file: &str) -> Result<(), MmuError> {
        let shared = &self.shared;
        if shared.printer.is_printing() {
            return Err(MmuError::Firmware(
                "cannot update firmware while printing".to_string(),
            ));
        }
        let firmware = resolve_firmware_path(file)?;

        let connection = shared.engine.connection();
        let port = if connection.is_autodetect() {
            connection.locator().autodetect()?
        } else {
            connection.port()
        };
        let port = port.ok_or(MmuError::PortNotFound)?;
        let tty = std::fs::canonicalize(&port).map_err(|_| {
            MmuError::Firmware(format!(
                "unable to find mmu2s device on port: {}",
                port.display()
            ))
        })?;
        let args = flash_args(&shared.config, &tty, &firmware);

        shared.teardown();
        shared.hardware_reset();

        for _ in 0..FLASH_BOOTLOADER_ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if connection.locator().resolve_identity(&port)? == FirmwareIdentity::Bootloader {
                let mut output = shared.flasher.run(&shared.config.flash_tool, &args)?;
                while let Some(line) = output.recv().await {
                    shared.printer.respond_info(&line);
                }
                return Ok(());
            }
        }
        Err(MmuError::Firmware(
            "unable to enter mmu2s bootloader".to_string(),
        ))
    }

    /// Port the device was last resolved to
    pub fn port(&self) -> Option<PathBuf> {
        self.shared.engine.connection().port()
    }
}

impl Shared {
    fn ensure_ready(&self, cmd: MmuCommand) -> Result<(), MmuError> {
        if self.mmu_ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MmuError::Disconnected(cmd.name().to_string()))
        }
    }

    async fn send(&self, cmd: MmuCommand, arg: Option<u32>) -> Result<String, MmuError> {
        let line = cmd.format(arg)?;
        let timeout = self.timeouts.for_command(cmd);
        match self.engine.send(&line, timeout, self.config.retries).await {
            Ok(payload) => Ok(payload),
            Err(e) => {
                if self.mmu_ready.swap(false, Ordering::SeqCst) {
                    info!("mmu2s: not ready after failed command {}", line);
                }
                self.finda.stop();
                Err(e)
            }
        }
    }

    fn hardware_reset(&self) {
        let print_time = self.printer.last_move_time();
        self.reset_pin.set_digital(print_time, false);
        let print_time = (print_time + RESET_PULSE_SECS).max(self.printer.last_move_time());
        self.reset_pin.set_digital(print_time, true);
    }

    fn teardown(&self) {
        self.mmu_ready.store(false, Ordering::SeqCst);
        self.finda.stop();
        if let Some(pending) = self
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pending.cancel();
        }
        self.engine.disconnect();
    }

    fn schedule_connect(self: &Arc<Self>, delay: Duration) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cancel.clone())
        {
            previous.cancel();
        }

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if let Err(e) = shared.engine.connect().await {
                error!("{}", e);
                shared.printer.respond_info(&e.to_string());
            }
        });
    }

    async fn handle_transfer(self: &Arc<Self>, line: String) {
        if line == HANDSHAKE {
            let link = Arc::new(FindaLink(Arc::downgrade(self)));
            let ready = self.finda.start(link).await.is_ok();
            self.mmu_ready.store(ready, Ordering::SeqCst);
            if ready {
                self.printer.respond_info("mmu2s: mmu ready for commands");
            }
        } else {
            self.printer
                .respond_info(&format!("mmu2s: unknown transfer from mmu\n{}", line));
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Finda reads for the poll loop. Holds the device weakly so a running poll
/// does not keep a dropped device alive.
struct FindaLink(Weak<Shared>);

impl FindaQuery for FindaLink {
    async fn read_finda(&self) -> Result<bool, MmuError> {
        let Some(shared) = self.0.upgrade() else {
            return Err(MmuError::Disconnected(MmuCommand::ReadFinda.name().to_string()));
        };
        let payload = shared.send(MmuCommand::ReadFinda, None).await?;
        parse_leading_int(&payload)
            .map(|value| value != 0)
            .ok_or_else(|| {
                MmuError::InvalidArgument(format!("unexpected Finda reading {:?}", payload))
            })
    }
}

/// Delivers MMU-initiated lines in arrival order
async fn event_loop(shared: Weak<Shared>, mut events: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.handle_transfer(line).await;
    }
}
