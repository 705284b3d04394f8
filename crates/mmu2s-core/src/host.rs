//! Host collaborators
//!
//! The driver lives inside a printer host. Everything it needs from that host
//! goes through the narrow traits below.

/// Printer-level services
pub trait Printer: Send + Sync {
    /// Show an informational message to the user
    fn respond_info(&self, msg: &str);

    /// Run a G-code script (runout reaction)
    fn run_script(&self, script: &str);

    /// Print time of the last queued toolhead move
    fn last_move_time(&self) -> f64;

    /// True while a print is running
    fn is_printing(&self) -> bool;
}

/// Digital output pin, used only for the MMU reset line
pub trait DigitalOut: Send + Sync {
    /// Maximum time the pin may stay at a non-default level (0 disables)
    fn setup_max_duration(&self, max_duration: f64);

    /// Level at startup and on shutdown
    fn setup_start_value(&self, start_value: bool, shutdown_value: bool);

    /// Schedule a level change at `print_time`
    fn set_digital(&self, print_time: f64, value: bool);
}

/// Callback invoked with `(eventtime, level)` when a button pin changes
pub type ButtonCallback = Box<dyn Fn(f64, bool) + Send + Sync>;

/// Button/switch registry
pub trait Buttons: Send + Sync {
    /// Register `callback` for state changes on `pins`
    fn register_buttons(&self, pins: &[&str], callback: ButtonCallback);
}

/// Reaction to a filament runout
pub trait RunoutReaction: Send + Sync {
    /// Called once per debounced runout
    fn on_runout(&self);
}

/// Runout reaction that runs a G-code template on the printer
pub struct RunoutScript<P: ?Sized> {
    printer: std::sync::Arc<P>,
    script: String,
}

impl<P: Printer + ?Sized> RunoutScript<P> {
    /// Run `script` on `printer` for each runout
    pub fn new(printer: std::sync::Arc<P>, script: impl Into<String>) -> Self {
        Self {
            printer,
            script: script.into(),
        }
    }
}

impl<P: Printer + ?Sized> RunoutReaction for RunoutScript<P> {
    fn on_runout(&self) {
        self.printer.run_script(&self.script);
    }
}
