//! Test doubles shared by the integration tests
#![allow(dead_code)]

use mmu2s_core::config::Mmu2sConfig;
use mmu2s_core::firmware::{FlashRunner, OutputLines};
use mmu2s_core::host::{ButtonCallback, Buttons, DigitalOut, Printer};
use mmu2s_core::protocol::{BoxedPort, ConnectionConfig, MmuError, PortLocator, PortOpener};
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;

pub const APPLICATION_ID: &str =
    "usb-Prusa_Research__prusa3d.com__Original_Prusa_i3_MK3_Multi_Material_2.0_upgrade-if00";
pub const BOOTLOADER_ID: &str =
    "usb-Prusa_Research__prusa3d.com__Original_Prusa_i3_MK3_Multi_Material_2.0_upgrade__bootloader_-if00";

/// Route driver logs to the test output; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fake udev tree with one tty
pub struct Fixture {
    _root: TempDir,
    pub tty: PathBuf,
    pub by_id: PathBuf,
    pub by_path: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let by_id = root.path().join("by-id");
        let by_path = root.path().join("by-path");
        std::fs::create_dir(&by_id).unwrap();
        std::fs::create_dir(&by_path).unwrap();
        let tty = root.path().join("ttyACM0");
        std::fs::write(&tty, b"").unwrap();
        Self {
            _root: root,
            tty,
            by_id,
            by_path,
        }
    }

    /// Replace the identity link of the tty
    pub fn set_identity(&self, name: &str) {
        for entry in std::fs::read_dir(&self.by_id).unwrap() {
            std::fs::remove_file(entry.unwrap().path()).unwrap();
        }
        symlink(&self.tty, self.by_id.join(name)).unwrap();
    }

    pub fn application(&self) {
        self.set_identity(APPLICATION_ID);
    }

    pub fn bootloader(&self) {
        self.set_identity(BOOTLOADER_ID);
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            port: Some(self.tty.clone()),
            locator: PortLocator::new(self.by_id.clone(), self.by_path.clone()),
            ..Default::default()
        }
    }

    pub fn mmu_config(&self) -> Mmu2sConfig {
        Mmu2sConfig {
            serial: Some(self.tty.display().to_string()),
            reset_pin: "PC5".to_string(),
            idler_sensor_pin: "PB7".to_string(),
            by_id_dir: self.by_id.clone(),
            by_path_dir: self.by_path.clone(),
            ..Default::default()
        }
    }
}

/// Opens in-memory pipes and hands the far ends to the test
pub struct PipeOpener {
    far_end: mpsc::UnboundedSender<DuplexStream>,
}

impl PipeOpener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { far_end: tx }), rx)
    }
}

impl PortOpener for PipeOpener {
    fn open(&self, _path: &Path, _baud_rate: u32) -> io::Result<BoxedPort> {
        let (near, far) = tokio::io::duplex(1024);
        self.far_end
            .send(far)
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "test dropped the far end"))?;
        Ok(Box::new(near))
    }
}

/// The MMU side of a pipe
pub struct FakeMmu {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeMmu {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Next command written by the host, without terminator
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches('\n').to_string()),
        }
    }

    /// Like `read_line`, but gives up after `wait`
    pub async fn read_line_within(&mut self, wait: Duration) -> Option<String> {
        tokio::time::timeout(wait, self.read_line()).await.ok().flatten()
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }
}

/// Answers host commands in the background; lines can also be pushed
/// unprompted with [`Responder::inject`].
pub struct Responder {
    writer: Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>,
    received: Arc<Mutex<Vec<String>>>,
}

impl Responder {
    pub fn spawn<F>(stream: DuplexStream, answer: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let received = Arc::new(Mutex::new(Vec::new()));

        let task_writer = writer.clone();
        let task_received = received.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                task_received.lock().unwrap().push(line.clone());
                if let Some(reply) = answer(&line) {
                    let mut w = task_writer.lock().await;
                    if w.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });

        Self { writer, received }
    }

    pub async fn inject(&self, line: &str) {
        let mut w = self.writer.lock().await;
        w.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, line: &str) -> usize {
        self.received().iter().filter(|l| *l == line).count()
    }
}

/// Replies of a healthy MMU with filament in the Finda
pub fn healthy_reply(line: &str) -> Option<String> {
    let reply = match line {
        "P0" => "1ok",
        "S1" => "302ok",
        "S2" => "372ok",
        "S3" => "0ok",
        _ => "ok",
    };
    Some(reply.to_string())
}

/// Records everything the driver reports to the printer
#[derive(Default)]
pub struct FakePrinter {
    pub messages: Mutex<Vec<String>>,
    pub scripts: Mutex<Vec<String>>,
    pub printing: AtomicBool,
    pub move_time: Mutex<f64>,
}

impl FakePrinter {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.messages()
            .iter()
            .filter(|m| m.contains(needle))
            .count()
    }
}

impl Printer for FakePrinter {
    fn respond_info(&self, msg: &str) {
        self.messages.lock().unwrap().push(msg.to_string());
    }

    fn run_script(&self, script: &str) {
        self.scripts.lock().unwrap().push(script.to_string());
    }

    fn last_move_time(&self) -> f64 {
        *self.move_time.lock().unwrap()
    }

    fn is_printing(&self) -> bool {
        self.printing.load(Ordering::SeqCst)
    }
}

/// Records reset pin activity
#[derive(Default)]
pub struct FakePin {
    pub max_duration: Mutex<Option<f64>>,
    pub start_value: Mutex<Option<(bool, bool)>>,
    pub levels: Mutex<Vec<(f64, bool)>>,
}

impl DigitalOut for FakePin {
    fn setup_max_duration(&self, max_duration: f64) {
        *self.max_duration.lock().unwrap() = Some(max_duration);
    }

    fn setup_start_value(&self, start_value: bool, shutdown_value: bool) {
        *self.start_value.lock().unwrap() = Some((start_value, shutdown_value));
    }

    fn set_digital(&self, print_time: f64, value: bool) {
        self.levels.lock().unwrap().push((print_time, value));
    }
}

#[derive(Default)]
pub struct FakeButtons {
    pub callback: Mutex<Option<ButtonCallback>>,
}

impl FakeButtons {
    pub fn set(&self, level: bool) {
        if let Some(cb) = self.callback.lock().unwrap().as_ref() {
            cb(0.0, level);
        }
    }
}

impl Buttons for FakeButtons {
    fn register_buttons(&self, _pins: &[&str], callback: ButtonCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }
}

/// Returns canned output instead of running a tool
#[derive(Default)]
pub struct FakeFlasher {
    pub calls: Mutex<Vec<(String, Vec<String>)>>,
    pub output: Vec<String>,
    pub runs: AtomicUsize,
}

impl FlashRunner for FakeFlasher {
    fn run(&self, program: &str, args: &[String]) -> Result<OutputLines, MmuError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        let (tx, rx) = mpsc::unbounded_channel();
        for line in &self.output {
            let _ = tx.send(line.clone());
        }
        Ok(rx)
    }
}
