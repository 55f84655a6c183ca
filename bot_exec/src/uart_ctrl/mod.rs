//! # UART Control module
//!
//! [`UartCtrl`] owns the serial link to the chassis microcontroller. It frames commands, paces
//! them out of a queue, watches the link with heartbeats and parses the telemetry coming back.
//!
//! Motion commands (velocity, yaw rate, leg height, roll, jump) only ever reach the wire while
//! control is enabled. If the microcontroller stops answering heartbeats the watchdog disables
//! control and sends a zero-motion and disarm sequence without waiting for anyone to ask.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod link;
pub mod mock;
mod params;
mod state;
pub mod transport;
mod workers;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::mcu::{BuzzerCmd, Command, RobotFeedback};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use self::link::Link;
use self::state::{lock, Shared};
use self::transport::{SerialTransport, Transport};

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

pub use self::mock::MockTransport;
pub use self::params::UartCtrlParams;
pub use self::state::{ConnectionHealth, FeedbackCallback, HeartbeatCallback};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Poll period used while waiting for workers to finish.
const JOIN_POLL_PERIOD: Duration = Duration::from_millis(5);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Serial protocol controller.
pub struct UartCtrl {
    shared: Arc<Shared>,

    queue_tx: Sender<Command>,

    /// Kept so the queue can be drained on emergency stop
    queue_rx: Receiver<Command>,

    workers: Vec<(&'static str, JoinHandle<()>)>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum UartCtrlError {
    #[error("Failed to load UartCtrlParams: {0}")]
    ParamLoadError(util::params::LoadError),

    #[error("Invalid UartCtrl parameters: {0}")]
    InvalidParams(String),

    #[error("Could not open serial port {0}: {1}")]
    OpenError(String, serialport::Error),

    #[error("Not connected to the microcontroller")]
    NotConnected,

    #[error("Motor control is not enabled")]
    NotEnabled,

    #[error("Microcontroller did not accept the enable command after {0} attempts")]
    EnableFailed(u32),

    #[error("Serial I/O error: {0}")]
    Io(std::io::Error),

    #[error("Could not start the {0} worker: {1}")]
    WorkerSpawnError(&'static str, std::io::Error),

    #[error("The command queue has been closed")]
    QueueClosed,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl UartCtrl {
    /// Create a new, unconnected controller.
    pub fn new(params: UartCtrlParams) -> Result<Self, UartCtrlError> {
        params.are_valid().map_err(UartCtrlError::InvalidParams)?;

        let (queue_tx, queue_rx) = unbounded();

        Ok(Self {
            shared: Arc::new(Shared::new(params)),
            queue_tx,
            queue_rx,
            workers: Vec::new(),
        })
    }

    /// Load the parameters from the given file and create a new controller.
    pub fn init(params_path: &str) -> Result<Self, UartCtrlError> {
        let params: UartCtrlParams =
            util::params::load(params_path).map_err(UartCtrlError::ParamLoadError)?;
        Self::new(params)
    }

    pub fn params(&self) -> &UartCtrlParams {
        &self.shared.params
    }

    /// Open the configured serial port and start the workers.
    pub fn connect(&mut self) -> Result<(), UartCtrlError> {
        if self.is_connected() {
            warn!("UartCtrl is already connected");
            return Ok(());
        }

        let p = &self.shared.params;
        let transport = SerialTransport::open(&p.port, p.baud_rate, p.read_timeout())
            .map_err(|e| UartCtrlError::OpenError(p.port.clone(), e))?;

        self.connect_with(Box::new(transport))
    }

    /// Start the controller over an already open transport.
    pub fn connect_with(&mut self, transport: Box<dyn Transport>) -> Result<(), UartCtrlError> {
        if self.is_connected() {
            warn!("UartCtrl is already connected");
            return Ok(());
        }

        let mut link = Link::new(transport);
        if let Err(e) = link.clear_input() {
            warn!("Could not clear stale serial input: {}", e);
        }

        // Anything left from a previous connection is stale
        let stale = self.queue_rx.try_iter().count();
        if stale > 0 {
            debug!("Dropped {} stale queued commands", stale);
        }

        *self.shared.lock_link() = Some(link);
        self.shared.reset_liveness();
        self.shared.enabled.store(false, Ordering::SeqCst);
        self.shared.enable_requested.store(false, Ordering::SeqCst);
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        if let Err(e) = self.spawn_workers() {
            self.disconnect();
            return Err(e);
        }

        info!("UartCtrl connected");
        Ok(())
    }

    fn spawn_workers(&mut self) -> Result<(), UartCtrlError> {
        let shared = self.shared.clone();
        let queue = self.queue_rx.clone();
        self.spawn("uart-sender", move || workers::sender(shared, queue))?;

        let shared = self.shared.clone();
        self.spawn("uart-watchdog", move || workers::watchdog(shared))?;

        let shared = self.shared.clone();
        self.spawn("uart-receiver", move || workers::receiver(shared))?;

        Ok(())
    }

    fn spawn<F>(&mut self, name: &'static str, f: F) -> Result<(), UartCtrlError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(f)
            .map_err(|e| UartCtrlError::WorkerSpawnError(name, e))?;
        self.workers.push((name, handle));
        Ok(())
    }

    /// Stop the workers, disarm the microcontroller and close the link.
    ///
    /// Each worker is given up to `worker_join_timeout_s` to finish, after which it is detached
    /// with a warning.
    pub fn disconnect(&mut self) {
        if !self.is_connected() && self.workers.is_empty() {
            return;
        }

        self.shared.running.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + self.shared.params.worker_join_timeout();
        for (name, handle) in self.workers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL_PERIOD);
            }

            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("UART worker {} panicked", name);
                }
            } else {
                warn!("UART worker {} did not stop in time, detaching it", name);
            }
        }

        {
            let mut guard = self.shared.lock_link();
            if let Some(link) = guard.as_mut() {
                if let Err(e) = link.send(&Command::Disable) {
                    warn!("Could not disarm the microcontroller on disconnect: {}", e);
                }
            }
            *guard = None;
        }

        self.queue_rx.try_iter().for_each(drop);
        self.shared.enable_requested.store(false, Ordering::SeqCst);
        self.shared.enabled.store(false, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);

        info!("UartCtrl disconnected");
    }

    /// Arm the microcontroller and set the leg height.
    pub fn enable_control(&self) -> Result<(), UartCtrlError> {
        if !self.is_connected() {
            warn!("Cannot enable control, not connected");
            return Err(UartCtrlError::NotConnected);
        }

        self.shared.enable_requested.store(false, Ordering::SeqCst);
        self.shared.arm()
    }

    /// Ask the watchdog to enable control at its next heartbeat that finds the link healthy.
    ///
    /// Returns straight away, use [`UartCtrl::is_enabled`] to see when control is armed. A pending
    /// request is cancelled by disabling control or an emergency stop.
    pub fn request_enable(&self) -> Result<(), UartCtrlError> {
        if !self.is_connected() {
            return Err(UartCtrlError::NotConnected);
        }

        if !self.is_enabled() && !self.shared.enable_requested.swap(true, Ordering::SeqCst) {
            debug!("Control enable requested");
        }

        Ok(())
    }

    /// Zero the motion demands and disarm the microcontroller.
    pub fn disable_control(&self) -> Result<(), UartCtrlError> {
        if !self.is_connected() {
            warn!("Cannot disable control, not connected");
            return Err(UartCtrlError::NotConnected);
        }

        self.shared.enable_requested.store(false, Ordering::SeqCst);

        let mut guard = self.shared.lock_link();
        let link = guard.as_mut().ok_or(UartCtrlError::NotConnected)?;

        for cmd in &[Command::Velocity(0.0), Command::YawRate(0.0)] {
            if let Err(e) = link.send(cmd) {
                warn!("Could not send {} while disabling: {}", cmd, e);
            }
        }
        link.send(&Command::Disable).map_err(UartCtrlError::Io)?;

        // Still holding the link, so the sender cannot slip a motion command in after the disarm
        self.shared.enabled.store(false, Ordering::SeqCst);
        info!("Motor control disabled");

        Ok(())
    }

    /// Queue a velocity and yaw rate demand, optionally with leg height and roll.
    ///
    /// Commands are transmitted in the order velocity, yaw rate, leg height, roll.
    pub fn send_motion_command(
        &self,
        velocity_ms: f64,
        yaw_rate_rads: f64,
        leg_height_m: Option<f64>,
        roll_rad: Option<f64>,
    ) -> Result<(), UartCtrlError> {
        self.check_can_move()?;

        self.enqueue(Command::Velocity(velocity_ms))?;
        self.enqueue(Command::YawRate(yaw_rate_rads))?;
        if let Some(h) = leg_height_m {
            self.enqueue(Command::LegHeight(h))?;
        }
        if let Some(r) = roll_rad {
            self.enqueue(Command::Roll(r))?;
        }

        Ok(())
    }

    /// Queue a body roll demand.
    pub fn send_roll(&self, roll_rad: f64) -> Result<(), UartCtrlError> {
        self.check_can_move()?;
        self.enqueue(Command::Roll(roll_rad))
    }

    /// Trigger a jump immediately.
    pub fn send_jump(&self) -> Result<(), UartCtrlError> {
        self.check_can_move()?;
        self.shared.transmit_motion(&Command::Jump)
    }

    /// Send a raw PWM test value immediately.
    pub fn send_pwm(&self, pwm: i32) -> Result<(), UartCtrlError> {
        if !self.is_connected() {
            return Err(UartCtrlError::NotConnected);
        }
        self.shared.transmit(&Command::Pwm(pwm))
    }

    /// Play a buzzer pattern immediately. Does not require control to be enabled.
    pub fn send_buzzer(&self, buzzer: BuzzerCmd) -> Result<(), UartCtrlError> {
        if !self.is_connected() {
            return Err(UartCtrlError::NotConnected);
        }
        self.shared.transmit(&Command::Buzzer(buzzer))
    }

    /// Drop everything queued, disable control and send the stop sequence if connected.
    ///
    /// Safe to call in any state.
    pub fn send_emergency_stop(&self) {
        warn!("EMERGENCY STOP");

        let dropped = self.queue_rx.try_iter().count();
        if dropped > 0 {
            debug!("Dropped {} queued commands", dropped);
        }

        // Cleared before taking the link, see Shared::transmit_motion
        self.shared.enable_requested.store(false, Ordering::SeqCst);
        self.shared.enabled.store(false, Ordering::SeqCst);

        if self.is_connected() && !self.shared.send_stop_sequence() {
            error!("Emergency stop could not disarm the microcontroller");
        }
    }

    /// Copy of the most recent telemetry.
    pub fn get_feedback(&self) -> RobotFeedback {
        self.shared.feedback()
    }

    /// Zero the position in the stored telemetry.
    pub fn reset_position(&self) {
        self.shared.reset_position()
    }

    pub fn get_connection_health(&self) -> ConnectionHealth {
        self.shared.health()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    /// Number of commands waiting to be transmitted.
    pub fn queue_len(&self) -> usize {
        self.queue_rx.len()
    }

    /// Set the function called with every decoded telemetry record.
    ///
    /// The callback runs on the receiving worker and must not call back into the controller's
    /// callback setters.
    pub fn set_feedback_callback<F>(&self, callback: F)
    where
        F: FnMut(&RobotFeedback) + Send + 'static,
    {
        *lock(&self.shared.feedback_callback) = Some(Box::new(callback));
    }

    /// Set the function called after every heartbeat with whether it was acknowledged.
    pub fn set_heartbeat_callback<F>(&self, callback: F)
    where
        F: FnMut(bool) + Send + 'static,
    {
        *lock(&self.shared.heartbeat_callback) = Some(Box::new(callback));
    }

    fn check_can_move(&self) -> Result<(), UartCtrlError> {
        if !self.is_connected() {
            warn!("Cannot send motion, not connected");
            return Err(UartCtrlError::NotConnected);
        }
        if !self.is_enabled() {
            warn!("Cannot send motion, control not enabled");
            return Err(UartCtrlError::NotEnabled);
        }
        Ok(())
    }

    fn enqueue(&self, cmd: Command) -> Result<(), UartCtrlError> {
        self.queue_tx.send(cmd).map_err(|_| UartCtrlError::QueueClosed)
    }
}

impl Drop for UartCtrl {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_params() -> UartCtrlParams {
        UartCtrlParams {
            read_timeout_s: 0.01,
            command_rate_hz: 200.0,
            heartbeat_interval_s: 0.02,
            heartbeat_timeout_s: 0.06,
            heartbeat_read_timeout_s: 0.01,
            enable_settle_s: 0.0,
            enable_pacing_s: 0.0,
            enable_retry_delay_s: 0.0,
            receive_idle_sleep_s: 0.001,
            worker_join_timeout_s: 0.5,
            ..Default::default()
        }
    }

    fn connected(params: UartCtrlParams, mock: &MockTransport) -> UartCtrl {
        let mut ctrl = UartCtrl::new(params).unwrap();
        ctrl.connect_with(Box::new(mock.clone())).unwrap();
        ctrl
    }

    fn wait_for<F: Fn() -> bool>(f: F, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    /// Written lines without heartbeat requests.
    fn lines(mock: &MockTransport) -> Vec<String> {
        mock.written_lines().into_iter().filter(|l| l != "?").collect()
    }

    /// True if `needle` appears in order (not necessarily adjacent) in `haystack`.
    fn contains_in_order(haystack: &[String], needle: &[&str]) -> bool {
        let mut it = haystack.iter();
        needle.iter().all(|n| it.any(|h| h == n))
    }

    #[test]
    fn test_rejects_when_not_connected() {
        let ctrl = UartCtrl::new(fast_params()).unwrap();

        assert!(matches!(
            ctrl.send_motion_command(0.5, 0.0, None, None),
            Err(UartCtrlError::NotConnected)
        ));
        assert!(matches!(ctrl.enable_control(), Err(UartCtrlError::NotConnected)));
        assert!(matches!(ctrl.send_pwm(10), Err(UartCtrlError::NotConnected)));

        // No-op on the wire but still safe
        ctrl.send_emergency_stop();
        assert_eq!(ctrl.queue_len(), 0);
        assert!(!ctrl.is_enabled());
    }

    #[test]
    fn test_rejects_motion_when_not_enabled() {
        let mock = MockTransport::new();
        let mut ctrl = connected(fast_params(), &mock);

        assert!(matches!(
            ctrl.send_motion_command(0.5, 0.1, None, None),
            Err(UartCtrlError::NotEnabled)
        ));
        assert!(matches!(ctrl.send_jump(), Err(UartCtrlError::NotEnabled)));
        assert_eq!(ctrl.queue_len(), 0);

        thread::sleep(Duration::from_millis(50));
        assert!(lines(&mock).is_empty());

        ctrl.disconnect();
    }

    #[test]
    fn test_enable_then_motion_in_order() {
        let mock = MockTransport::new();
        let mut ctrl = connected(fast_params(), &mock);

        ctrl.enable_control().unwrap();
        assert!(ctrl.is_enabled());
        assert!(contains_in_order(&lines(&mock), &["E1", "H150"]));

        ctrl.send_motion_command(0.8, -0.3, Some(0.1), None).unwrap();

        assert!(wait_for(|| lines(&mock).contains(&"H100".to_string()), 1000));
        assert!(contains_in_order(&lines(&mock), &["H150", "V800", "Y-300", "H100"]));

        ctrl.disconnect();
    }

    #[test]
    fn test_disable_sequence() {
        let mock = MockTransport::new();
        let mut ctrl = connected(fast_params(), &mock);

        ctrl.enable_control().unwrap();
        ctrl.disable_control().unwrap();

        assert!(!ctrl.is_enabled());
        assert!(contains_in_order(&lines(&mock), &["E1", "H150", "V0", "Y0", "E0"]));

        ctrl.disconnect();
    }

    #[test]
    fn test_emergency_stop_drains_queue() {
        let mock = MockTransport::new();
        let mut params = fast_params();
        params.command_rate_hz = 5.0;
        let mut ctrl = connected(params, &mock);

        ctrl.enable_control().unwrap();
        for _ in 0..10 {
            ctrl.send_motion_command(0.5, 0.2, None, None).unwrap();
        }

        ctrl.send_emergency_stop();

        assert_eq!(ctrl.queue_len(), 0);
        assert!(!ctrl.is_enabled());

        // Give the sender time to trip over anything it had already dequeued
        thread::sleep(Duration::from_millis(300));

        let l = lines(&mock);
        assert_eq!(&l[l.len() - 3..], &["V0", "Y0", "E0"]);

        ctrl.disconnect();
    }

    #[test]
    fn test_link_lost_disables() {
        let mock = MockTransport::new();
        mock.set_responsive(false);
        let mut ctrl = connected(fast_params(), &mock);

        let acks = Arc::new(AtomicUsize::new(0));
        let misses = Arc::new(AtomicUsize::new(0));
        {
            let acks = acks.clone();
            let misses = misses.clone();
            ctrl.set_heartbeat_callback(move |ok| {
                if ok {
                    acks.fetch_add(1, Ordering::SeqCst);
                } else {
                    misses.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        ctrl.enable_control().unwrap();

        assert!(wait_for(|| !ctrl.is_enabled(), 2000));

        let l = lines(&mock);
        let armed_at = l.iter().rposition(|s| s == "H150").unwrap();
        assert!(contains_in_order(&l[armed_at..], &["V0", "Y0", "E0"]));

        // Loss of the link does not mean loss of the connection
        assert!(ctrl.is_connected());

        let health = ctrl.get_connection_health();
        assert!(health.missed_heartbeats >= 3);
        assert!(!health.healthy);
        assert_eq!(acks.load(Ordering::SeqCst), 0);
        assert!(misses.load(Ordering::SeqCst) >= 3);

        // Motion is rejected until control is re-enabled
        assert!(matches!(
            ctrl.send_motion_command(0.1, 0.0, None, None),
            Err(UartCtrlError::NotEnabled)
        ));

        ctrl.disconnect();
    }

    #[test]
    fn test_healthy_link() {
        let mock = MockTransport::new();
        let mut ctrl = connected(fast_params(), &mock);

        ctrl.enable_control().unwrap();
        thread::sleep(Duration::from_millis(200));

        let health = ctrl.get_connection_health();
        assert!(health.connected);
        assert!(health.enabled);
        assert!(ctrl.is_enabled());
        assert!(health.last_response_age < Duration::from_millis(150));

        ctrl.disconnect();
    }

    #[test]
    fn test_feedback() {
        let mock = MockTransport::new();
        let mut ctrl = connected(fast_params(), &mock);

        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            ctrl.set_feedback_callback(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(!ctrl.get_feedback().valid);

        mock.inject_line("Fgarbage");
        mock.inject_line("F0.50,1.00,0.78,0.10");

        assert!(wait_for(|| ctrl.get_feedback().valid, 1000));

        let fb = ctrl.get_feedback();
        assert_eq!(fb.velocity_ms, 0.50);
        assert_eq!(fb.position_m, 1.00);
        assert_eq!(fb.yaw_rad, 0.78);
        assert_eq!(fb.yaw_rate_rads, 0.10);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        ctrl.reset_position();
        assert_eq!(ctrl.get_feedback().position_m, 0.0);
        assert_eq!(ctrl.get_feedback().velocity_ms, 0.50);

        ctrl.disconnect();
    }

    #[test]
    fn test_disconnect() {
        let mock = MockTransport::new();
        let mut ctrl = connected(fast_params(), &mock);

        ctrl.enable_control().unwrap();
        ctrl.send_buzzer(BuzzerCmd::Beep).unwrap();
        ctrl.disconnect();

        assert!(!ctrl.is_connected());
        assert!(!ctrl.is_enabled());
        assert_eq!(lines(&mock).last().map(String::as_str), Some("E0"));
        assert!(lines(&mock).contains(&"B1".to_string()));
        assert!(matches!(ctrl.send_buzzer(BuzzerCmd::Off), Err(UartCtrlError::NotConnected)));

        // A second disconnect is harmless
        ctrl.disconnect();
    }

    #[test]
    fn test_enable_gives_up_after_retries() {
        let mock = MockTransport::new();
        let mut ctrl = connected(fast_params(), &mock);

        mock.set_fail_writes(true);
        assert!(matches!(ctrl.enable_control(), Err(UartCtrlError::EnableFailed(3))));
        assert!(!ctrl.is_enabled());

        let attempts = mock.rejected_lines().iter().filter(|l| *l == "E1").count();
        assert_eq!(attempts, 3);
        assert!(!mock.rejected_lines().contains(&"H150".to_string()));

        mock.set_fail_writes(false);
        ctrl.disconnect();
    }

    #[test]
    fn test_workers_survive_write_errors() {
        let mock = MockTransport::new();
        let mut ctrl = connected(fast_params(), &mock);

        ctrl.enable_control().unwrap();

        mock.set_fail_writes(true);
        ctrl.send_motion_command(0.5, 0.0, None, None).ok();
        assert!(wait_for(
            || ctrl.get_connection_health().missed_heartbeats >= 3,
            1000
        ));
        assert!(wait_for(|| !ctrl.is_enabled(), 1000));

        mock.set_fail_writes(false);

        // Watchdog still running
        assert!(wait_for(|| ctrl.get_connection_health().healthy, 1000));
        assert!(ctrl.is_connected());

        // Sender still running
        ctrl.enable_control().unwrap();
        ctrl.send_motion_command(0.7, 0.0, None, None).unwrap();
        assert!(wait_for(|| lines(&mock).contains(&"V700".to_string()), 1000));

        ctrl.disconnect();
    }

    #[test]
    fn test_strict_heartbeat_ack() {
        let mock = MockTransport::new();
        mock.set_heartbeat_reply("xyz");
        let mut params = fast_params();
        params.strict_heartbeat_ack = true;
        let mut ctrl = connected(params, &mock);

        ctrl.enable_control().unwrap();

        // Noise does not count as an answer
        assert!(wait_for(|| !ctrl.is_enabled(), 2000));
        assert!(ctrl.get_connection_health().missed_heartbeats >= 3);

        ctrl.disconnect();
    }

    #[test]
    fn test_permissive_heartbeat_ack() {
        let mock = MockTransport::new();
        mock.set_heartbeat_reply("xyz");
        let mut ctrl = connected(fast_params(), &mock);

        ctrl.enable_control().unwrap();
        thread::sleep(Duration::from_millis(200));

        // Any line counts as an answer
        let health = ctrl.get_connection_health();
        assert!(health.healthy);
        assert!(health.enabled);
        assert_eq!(health.missed_heartbeats, 0);

        ctrl.disconnect();
    }

    #[test]
    fn test_request_enable() {
        let unconnected = UartCtrl::new(fast_params()).unwrap();
        assert!(matches!(unconnected.request_enable(), Err(UartCtrlError::NotConnected)));

        let mock = MockTransport::new();
        mock.set_responsive(false);
        let mut ctrl = connected(fast_params(), &mock);

        ctrl.request_enable().unwrap();

        // Held until the link answers
        thread::sleep(Duration::from_millis(150));
        assert!(!ctrl.is_enabled());

        mock.set_responsive(true);
        assert!(wait_for(|| ctrl.is_enabled(), 1000));
        assert!(contains_in_order(&lines(&mock), &["E1", "H150"]));

        // Nothing to do once enabled
        ctrl.request_enable().unwrap();
        assert!(ctrl.is_enabled());

        ctrl.disconnect();
    }

    #[test]
    fn test_emergency_stop_cancels_enable_request() {
        let mock = MockTransport::new();
        mock.set_responsive(false);
        let mut ctrl = connected(fast_params(), &mock);

        ctrl.request_enable().unwrap();
        ctrl.send_emergency_stop();

        mock.set_responsive(true);
        assert!(wait_for(|| ctrl.get_connection_health().healthy, 1000));
        thread::sleep(Duration::from_millis(100));

        assert!(!ctrl.is_enabled());
        assert!(!lines(&mock).contains(&"E1".to_string()));

        ctrl.disconnect();
    }

    #[test]
    fn test_roll() {
        let mock = MockTransport::new();
        let mut ctrl = connected(fast_params(), &mock);

        assert!(matches!(ctrl.send_roll(-0.1), Err(UartCtrlError::NotEnabled)));

        ctrl.enable_control().unwrap();
        ctrl.send_roll(-0.1).unwrap();
        assert!(wait_for(|| lines(&mock).contains(&"R-100".to_string()), 1000));
        assert!(contains_in_order(&lines(&mock), &["E1", "H150", "R-100"]));

        ctrl.disconnect();
    }

    #[test]
    fn test_invalid_params() {
        let mut params = fast_params();
        params.max_missed_heartbeats = 0;
        assert!(matches!(UartCtrl::new(params), Err(UartCtrlError::InvalidParams(_))));
    }
}
