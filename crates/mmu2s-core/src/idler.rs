//! Idler (IR) filament sensor
//!
//! Wired to a printer MCU pin rather than the MMU, so it is read through the
//! host's button registry. Reading returns the last reported level; no I/O
//! happens at read time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::host::Buttons;

/// Idler sensor state, updated by the button callback
#[derive(Debug, Clone)]
pub struct IdlerSensor {
    last_state: Arc<AtomicBool>,
}

impl IdlerSensor {
    /// Register for changes on `pin`
    pub fn new(pin: &str, buttons: &dyn Buttons) -> Self {
        let last_state = Arc::new(AtomicBool::new(false));
        let state = last_state.clone();
        buttons.register_buttons(
            &[pin],
            Box::new(move |_eventtime, level| state.store(level, Ordering::SeqCst)),
        );
        Self { last_state }
    }

    /// Last reported level
    pub fn state(&self) -> bool {
        self.last_state.load(Ordering::SeqCst)
    }

    /// MMU_READ_IR report
    pub fn report(&self) -> String {
        format!("mmu2s: IR Sensor Status = [{}]", u8::from(self.state()))
    }
}
