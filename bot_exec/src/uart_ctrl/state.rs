//! # State shared between the controller and its workers

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::mcu::{Command, Inbound, RobotFeedback};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use util::time::seconds_to_std;

use super::{link::Link, params::UartCtrlParams, UartCtrlError};

// ------------------------------------------------------------------------------------------------
// TYPES
// ------------------------------------------------------------------------------------------------

/// Called with every decoded telemetry record.
pub type FeedbackCallback = Box<dyn FnMut(&RobotFeedback) + Send>;

/// Called after every heartbeat with whether it was acknowledged.
pub type HeartbeatCallback = Box<dyn FnMut(bool) + Send>;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Snapshot of the link's health.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConnectionHealth {
    pub connected: bool,
    pub enabled: bool,
    pub missed_heartbeats: u32,

    /// Time since the microcontroller last confirmed it was alive
    pub last_response_age: Duration,

    /// Connected and no heartbeats outstanding
    pub healthy: bool,
}

/// Heartbeat bookkeeping.
pub(crate) struct Liveness {
    pub missed: u32,
    pub last_response: Instant,

    /// Set once the watchdog has handled the current lost episode
    pub lost_handled: bool,
}

/// Everything the workers need, held in an `Arc`.
pub(crate) struct Shared {
    pub params: UartCtrlParams,

    pub link: Mutex<Option<Link>>,

    pub running: AtomicBool,
    pub connected: AtomicBool,
    pub enabled: AtomicBool,

    /// Set when the watchdog should arm the microcontroller once the link is healthy
    pub enable_requested: AtomicBool,

    pub liveness: Mutex<Liveness>,
    pub feedback: Mutex<RobotFeedback>,

    pub feedback_callback: Mutex<Option<FeedbackCallback>>,
    pub heartbeat_callback: Mutex<Option<HeartbeatCallback>>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Liveness {
    fn new() -> Self {
        Self {
            missed: 0,
            last_response: Instant::now(),
            lost_handled: false,
        }
    }
}

impl Shared {
    pub fn new(params: UartCtrlParams) -> Self {
        Self {
            params,
            link: Mutex::new(None),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            enable_requested: AtomicBool::new(false),
            liveness: Mutex::new(Liveness::new()),
            feedback: Mutex::new(RobotFeedback::default()),
            feedback_callback: Mutex::new(None),
            heartbeat_callback: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn lock_link(&self) -> MutexGuard<'_, Option<Link>> {
        lock(&self.link)
    }

    pub fn lock_liveness(&self) -> MutexGuard<'_, Liveness> {
        lock(&self.liveness)
    }

    /// Transmit a command directly, bypassing the queue.
    pub fn transmit(&self, cmd: &Command) -> Result<(), UartCtrlError> {
        match self.lock_link().as_mut() {
            Some(link) => link.send(cmd).map_err(UartCtrlError::Io),
            None => Err(UartCtrlError::NotConnected),
        }
    }

    /// Transmit a motion command only if the controller is enabled.
    ///
    /// The enabled flag is checked while holding the link, so nothing sent here can follow a stop
    /// sequence, which always clears the flag before taking the link.
    pub fn transmit_motion(&self, cmd: &Command) -> Result<(), UartCtrlError> {
        let mut guard = self.lock_link();
        let link = guard.as_mut().ok_or(UartCtrlError::NotConnected)?;

        if !self.is_enabled() {
            return Err(UartCtrlError::NotEnabled);
        }

        link.send(cmd).map_err(UartCtrlError::Io)
    }

    /// Arm the microcontroller, retrying the enable command, then set the leg height.
    ///
    /// Blocks for the settle and pacing delays.
    pub fn arm(&self) -> Result<(), UartCtrlError> {
        let p = &self.params;

        thread::sleep(seconds_to_std(p.enable_settle_s));

        let mut armed = false;
        for attempt in 1..=p.enable_retries {
            match self.transmit(&Command::Enable) {
                Ok(()) => {
                    armed = true;
                    thread::sleep(seconds_to_std(p.enable_pacing_s));
                    break;
                }
                Err(e) => {
                    warn!("Enable attempt {}/{} failed: {}", attempt, p.enable_retries, e);
                    thread::sleep(seconds_to_std(p.enable_retry_delay_s));
                }
            }
        }

        if !armed {
            error!("Could not enable motor control");
            return Err(UartCtrlError::EnableFailed(p.enable_retries));
        }

        if let Err(e) = self.transmit(&Command::LegHeight(p.leg_height_m)) {
            warn!("Could not set the leg height: {}", e);
        }

        self.enabled.store(true, Ordering::SeqCst);
        info!("Motor control enabled");

        Ok(())
    }

    /// Best effort zero motion then disarm. Each command is attempted even if an earlier one
    /// failed. Returns true if the disarm was transmitted.
    pub fn send_stop_sequence(&self) -> bool {
        let mut guard = self.lock_link();
        let link = match guard.as_mut() {
            Some(l) => l,
            None => return false,
        };

        let mut disarmed = false;
        for cmd in &[Command::Velocity(0.0), Command::YawRate(0.0), Command::Disable] {
            match link.send(cmd) {
                Ok(()) => disarmed = *cmd == Command::Disable,
                Err(e) => warn!("Could not send {} during stop sequence: {}", cmd, e),
            }
        }

        disarmed
    }

    /// Mark the microcontroller as alive.
    pub fn confirm_response(&self) {
        let mut l = self.lock_liveness();
        l.missed = 0;
        l.last_response = Instant::now();
        l.lost_handled = false;
    }

    /// Count an unanswered heartbeat.
    pub fn record_miss(&self) {
        let mut l = self.lock_liveness();
        l.missed = l.missed.saturating_add(1);
    }

    /// Restart heartbeat bookkeeping, used when a new link is opened.
    pub fn reset_liveness(&self) {
        *self.lock_liveness() = Liveness::new();
    }

    /// Act on a single inbound line and return its classification.
    ///
    /// Telemetry updates the stored feedback and fires the feedback callback, recognised lines
    /// confirm the link is alive, malformed telemetry is discarded.
    pub fn handle_inbound(&self, line: &str) -> Inbound {
        let inbound = Inbound::classify(line);

        match &inbound {
            Inbound::Feedback(fb) => {
                *lock(&self.feedback) = *fb;
                self.confirm_response();

                if let Some(cb) = lock(&self.feedback_callback).as_mut() {
                    cb(fb);
                }
            }
            Inbound::BadFeedback(e) => warn!("Discarding malformed telemetry {:?}: {}", line, e),
            Inbound::Ok | Inbound::HeartbeatAck => self.confirm_response(),
            Inbound::Err => {
                debug!("Microcontroller reported an error");
                self.confirm_response()
            }
            Inbound::Other(s) => debug!("Unrecognised line from microcontroller: {:?}", s),
            Inbound::Empty => (),
        }

        inbound
    }

    pub fn feedback(&self) -> RobotFeedback {
        *lock(&self.feedback)
    }

    pub fn reset_position(&self) {
        lock(&self.feedback).position_m = 0.0;
    }

    pub fn notify_heartbeat(&self, acked: bool) {
        if let Some(cb) = lock(&self.heartbeat_callback).as_mut() {
            cb(acked);
        }
    }

    pub fn health(&self) -> ConnectionHealth {
        let connected = self.is_connected();
        let l = self.lock_liveness();

        ConnectionHealth {
            connected,
            enabled: self.is_enabled(),
            missed_heartbeats: l.missed,
            last_response_age: l.last_response.elapsed(),
            healthy: connected && l.missed == 0,
        }
    }
}

/// Lock a mutex, recovering the data if a worker panicked while holding it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
