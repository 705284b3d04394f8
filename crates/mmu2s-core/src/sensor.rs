//! Finda filament sensor
//!
//! The Finda sits on the MMU and is only reachable through the serial
//! protocol, so it is polled with `P0` on a short timer. A present-to-absent
//! transition raises a runout, debounced so that bounce cannot fire the
//! reaction twice within [`EVENT_DELAY`].

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::host::RunoutReaction;
use crate::protocol::MmuError;

/// Minimum time between two runout events
pub const EVENT_DELAY: Duration = Duration::from_secs(3);

/// Poll interval
pub const FINDA_REFRESH_TIME: Duration = Duration::from_millis(300);

/// Source of Finda readings
pub trait FindaQuery: Send + Sync + 'static {
    /// Read the sensor; `true` means filament present
    fn read_finda(&self) -> impl Future<Output = Result<bool, MmuError>> + Send;
}

/// What a single reading did to the sensor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Same value as before
    Unchanged,
    /// Filament appeared
    Inserted,
    /// Filament disappeared and a runout fires
    Runout,
    /// Filament disappeared but the event was suppressed (debounce or
    /// disabled)
    RunoutSuppressed,
}

/// Sensor state
#[derive(Debug, Clone)]
pub struct FindaState {
    /// Last observed presence
    pub last_state: bool,
    /// Time of the last raised runout
    pub last_event_time: Option<Instant>,
    /// Toggled with SET_FILAMENT_SENSOR
    pub sensor_enabled: bool,
    /// Host-level runout switch
    pub runout_enabled: bool,
    /// Poll loop running
    pub polling: bool,
}

impl Default for FindaState {
    fn default() -> Self {
        Self {
            last_state: false,
            last_event_time: None,
            sensor_enabled: true,
            runout_enabled: true,
            polling: false,
        }
    }
}

impl FindaState {
    /// Apply a reading taken at `now`
    pub fn observe(&mut self, present: bool, now: Instant) -> Transition {
        if present == self.last_state {
            return Transition::Unchanged;
        }
        self.last_state = present;
        if present {
            return Transition::Inserted;
        }

        let debounced = self
            .last_event_time
            .map_or(true, |last| now.saturating_duration_since(last) >= EVENT_DELAY);
        if self.runout_enabled && self.sensor_enabled && debounced {
            self.last_event_time = Some(now);
            Transition::Runout
        } else {
            Transition::RunoutSuppressed
        }
    }
}

fn lock(state: &Mutex<FindaState>) -> MutexGuard<'_, FindaState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Finda poll state machine
pub struct FindaSensor {
    state: Arc<Mutex<FindaState>>,
    poll: Mutex<Option<CancellationToken>>,
    reaction: Arc<dyn RunoutReaction>,
    refresh: Duration,
}

impl std::fmt::Debug for FindaSensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FindaSensor")
            .field("state", &*lock(&self.state))
            .field("refresh", &self.refresh)
            .finish()
    }
}

impl FindaSensor {
    /// Create a stopped sensor that calls `reaction` on runout
    pub fn new(reaction: Arc<dyn RunoutReaction>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FindaState::default())),
            poll: Mutex::new(None),
            reaction,
            refresh: FINDA_REFRESH_TIME,
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> FindaState {
        lock(&self.state).clone()
    }

    /// Last observed presence
    pub fn filament_present(&self) -> bool {
        lock(&self.state).last_state
    }

    /// Check if the poll loop is running
    pub fn is_polling(&self) -> bool {
        lock(&self.state).polling
    }

    /// Enable or disable runout events (SET_FILAMENT_SENSOR)
    pub fn set_enabled(&self, enabled: bool) {
        lock(&self.state).sensor_enabled = enabled;
    }

    /// Host-level runout switch
    pub fn set_runout_enabled(&self, enabled: bool) {
        lock(&self.state).runout_enabled = enabled;
    }

    /// QUERY_FILAMENT_SENSOR report
    pub fn query_message(&self) -> &'static str {
        if self.filament_present() {
            "Finda: filament detected"
        } else {
            "Finda: filament not detected"
        }
    }

    /// Seed the state with one reading and start polling.
    ///
    /// On a failed reading the sensor stays stopped and the error is
    /// returned.
    pub async fn start<Q: FindaQuery>(&self, query: Arc<Q>) -> Result<(), MmuError> {
        self.stop();

        let present = match query.read_finda().await {
            Ok(present) => present,
            Err(e) => {
                error!("mmu2s: error reading Finda, cannot initialize: {}", e);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        {
            let mut state = lock(&self.state);
            state.last_state = present;
            state.polling = true;
        }
        *self.poll.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());

        tokio::spawn(poll_loop(
            query,
            self.state.clone(),
            self.reaction.clone(),
            cancel,
            self.refresh,
        ));
        Ok(())
    }

    /// Stop polling. Idempotent.
    pub fn stop(&self) {
        if let Some(cancel) = self
            .poll
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
        lock(&self.state).polling = false;
    }
}

impl Drop for FindaSensor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop<Q: FindaQuery>(
    query: Arc<Q>,
    state: Arc<Mutex<FindaState>>,
    reaction: Arc<dyn RunoutReaction>,
    cancel: CancellationToken,
    refresh: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(refresh) => {}
        }

        // Not raced against cancellation: dropping a send mid-write could
        // leave half a command on the wire.
        let present = match query.read_finda().await {
            Ok(present) => present,
            Err(e) => {
                error!("mmu2s: error reading Finda, stopping timer: {}", e);
                if !cancel.is_cancelled() {
                    lock(&state).polling = false;
                }
                return;
            }
        };
        if cancel.is_cancelled() {
            return;
        }

        let now = Instant::now();
        let transition = lock(&state).observe(present, now);
        if transition == Transition::Runout {
            info!("switch_sensor: runout event detected, Time {:?}", now);
            reaction.on_runout();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingReaction(AtomicUsize);

    impl RunoutReaction for CountingReaction {
        fn on_runout(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Plays back scripted readings; fails once they run out
    struct Script {
        readings: Mutex<VecDeque<Result<bool, ()>>>,
        reads: AtomicUsize,
    }

    impl Script {
        fn new(readings: &[Result<bool, ()>]) -> Arc<Self> {
            Arc::new(Self {
                readings: Mutex::new(readings.iter().copied().collect()),
                reads: AtomicUsize::new(0),
            })
        }
    }

    impl FindaQuery for Script {
        async fn read_finda(&self) -> Result<bool, MmuError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let next = self.readings.lock().unwrap().pop_front();
            match next {
                Some(Ok(v)) => Ok(v),
                _ => Err(MmuError::ProtocolTimeout("P0".to_string())),
            }
        }
    }

    #[test]
    fn test_bounce_within_window_fires_once() {
        let mut state = FindaState::default();
        let t0 = Instant::now();
        assert_eq!(state.observe(true, t0), Transition::Inserted);
        assert_eq!(
            state.observe(false, t0 + Duration::from_millis(300)),
            Transition::Runout
        );
        assert_eq!(
            state.observe(true, t0 + Duration::from_millis(600)),
            Transition::Inserted
        );
        assert_eq!(
            state.observe(false, t0 + Duration::from_millis(900)),
            Transition::RunoutSuppressed
        );
    }

    #[test]
    fn test_events_outside_window_both_fire() {
        let mut state = FindaState {
            last_state: true,
            ..Default::default()
        };
        let t0 = Instant::now();
        assert_eq!(state.observe(false, t0), Transition::Runout);
        let later = t0 + Duration::from_secs(4);
        assert_eq!(state.observe(true, later), Transition::Inserted);
        assert_eq!(
            state.observe(false, later + Duration::from_millis(300)),
            Transition::Runout
        );
    }

    #[test]
    fn test_disabled_sensor_suppresses() {
        let mut state = FindaState {
            last_state: true,
            sensor_enabled: false,
            ..Default::default()
        };
        assert_eq!(
            state.observe(false, Instant::now()),
            Transition::RunoutSuppressed
        );
        assert_eq!(state.last_event_time, None);
        assert!(!state.last_state);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_debounces_runouts() {
        let reaction = Arc::new(CountingReaction::default());
        let sensor = FindaSensor::new(reaction.clone());
        let script = Script::new(&[Ok(true), Ok(false), Ok(true), Ok(false), Ok(false)]);

        sensor.start(script.clone()).await.unwrap();
        assert!(sensor.is_polling());
        assert!(sensor.filament_present());

        // Four ticks at 0.3s cover the flip-flop in about a second
        tokio::time::sleep(Duration::from_millis(1250)).await;
        assert_eq!(reaction.0.load(Ordering::SeqCst), 1);
        assert_eq!(sensor.query_message(), "Finda: filament not detected");

        // Script exhausted: the next read fails and the loop stops itself
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!sensor.is_polling());
        assert_eq!(script.reads.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runout_after_window_fires_again() {
        let reaction = Arc::new(CountingReaction::default());
        let sensor = FindaSensor::new(reaction.clone());
        let mut readings = vec![Ok(true), Ok(false)];
        // ~4s of unchanged readings
        readings.extend(std::iter::repeat(Ok(false)).take(13));
        readings.extend([Ok(true), Ok(false)]);
        let script = Script::new(&readings);

        sensor.start(script).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(reaction.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_seed_stays_stopped() {
        let sensor = FindaSensor::new(Arc::new(CountingReaction::default()));
        let script = Script::new(&[Err(())]);
        assert!(sensor.start(script).await.is_err());
        assert!(!sensor.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_polling() {
        let sensor = FindaSensor::new(Arc::new(CountingReaction::default()));
        let script = Script::new(&[Ok(true); 20]);
        sensor.start(script.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        sensor.stop();
        sensor.stop();
        let reads = script.reads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(script.reads.load(Ordering::SeqCst), reads);
        assert!(!sensor.is_polling());
    }
}
