//! # Controller worker threads
//!
//! Three workers run for the lifetime of a connection:
//!
//! - `sender` - drains the command queue at the configured rate
//! - `watchdog` - checks the link with heartbeats and forces a safe stop if it goes quiet
//! - `receiver` - reads telemetry and acknowledgements
//!
//! All of them exit once the running flag is cleared and never exit on an I/O error.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::mcu::Command;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, trace, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{state::Shared, UartCtrlError};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Longest single sleep taken by a worker, so that stopping is noticed promptly.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(20);

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Transmit queued commands, at most one per command period.
///
/// Motion commands dequeued while the controller is disabled are discarded.
pub(crate) fn sender(shared: Arc<Shared>, queue: Receiver<Command>) {
    let period = shared.params.command_period();
    let queue_wait = shared.params.read_timeout();

    debug!("UART sender started");

    while shared.is_running() {
        let cmd = match queue.recv_timeout(queue_wait) {
            Ok(c) => c,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let sent_at = Instant::now();

        let result = if cmd.is_motion() {
            shared.transmit_motion(&cmd)
        } else {
            shared.transmit(&cmd)
        };

        match result {
            Ok(()) => (),
            Err(UartCtrlError::NotEnabled) => trace!("Discarding {} as control is disabled", cmd),
            Err(e) => warn!("Failed to send {}: {}", cmd, e),
        }

        sleep_while_running(&shared, period.checked_sub(sent_at.elapsed()));
    }

    debug!("UART sender stopped");
}

/// Ping the link every heartbeat interval and declare it lost when it stays quiet.
pub(crate) fn watchdog(shared: Arc<Shared>) {
    let interval = shared.params.heartbeat_interval();

    debug!("UART watchdog started");

    while shared.is_running() {
        let cycle_start = Instant::now();

        let acked = heartbeat(&shared);
        shared.notify_heartbeat(acked);

        check_link_lost(&shared);
        serve_enable_request(&shared);

        sleep_while_running(&shared, interval.checked_sub(cycle_start.elapsed()));
    }

    debug!("UART watchdog stopped");
}

/// Read and dispatch inbound lines.
pub(crate) fn receiver(shared: Arc<Shared>) {
    let read_timeout = shared.params.read_timeout();
    let idle_sleep = shared.params.receive_idle_sleep();

    debug!("UART receiver started");

    while shared.is_running() {
        let line = {
            let mut guard = shared.lock_link();
            match guard.as_mut() {
                Some(link) => match link.has_input() {
                    Ok(true) => link.read_line(read_timeout),
                    Ok(false) => Ok(None),
                    Err(e) => Err(e),
                },
                None => Ok(None),
            }
        };

        match line {
            Ok(Some(l)) => {
                shared.handle_inbound(&l);
            }
            Ok(None) => thread::sleep(idle_sleep),
            Err(e) => {
                warn!("UART receive error: {}", e);
                thread::sleep(idle_sleep);
            }
        }
    }

    debug!("UART receiver stopped");
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Send one heartbeat and wait for a reply. Returns true if the reply counts as an
/// acknowledgement.
fn heartbeat(shared: &Shared) -> bool {
    let reply = {
        let mut guard = shared.lock_link();
        match guard.as_mut() {
            Some(link) => link
                .send(&Command::Heartbeat)
                .and_then(|_| link.read_line(shared.params.heartbeat_read_timeout())),
            None => return false,
        }
    };

    let acked = match reply {
        Ok(Some(line)) if !line.is_empty() => {
            // Route the reply through the normal inbound handling so telemetry is never lost
            let inbound = shared.handle_inbound(&line);
            inbound.is_recognised() || !shared.params.strict_heartbeat_ack
        }
        Ok(_) => false,
        Err(e) => {
            warn!("Heartbeat failed: {}", e);
            false
        }
    };

    if acked {
        shared.confirm_response();
    } else {
        shared.record_miss();
    }

    acked
}

/// Force a safe stop if the link has gone quiet.
///
/// The stop sequence is sent once per lost episode, and again if the controller was re-enabled
/// while the link was still lost. The connected flag is left alone.
fn check_link_lost(shared: &Shared) {
    let first_in_episode = {
        let mut l = shared.lock_liveness();
        let lost = l.missed >= shared.params.max_missed_heartbeats
            && l.last_response.elapsed() > shared.params.heartbeat_timeout();

        if !lost {
            return;
        }

        let first = !l.lost_handled;
        l.lost_handled = true;
        first
    };

    // Clear enabled before taking the link so that no queued motion can follow the stop
    let was_enabled = shared.enabled.swap(false, Ordering::SeqCst);

    if first_in_episode || was_enabled {
        error!(
            "Heartbeat lost ({} missed), disabling motor control",
            shared.lock_liveness().missed
        );
        shared.send_stop_sequence();
    }
}

/// Arm the microcontroller if asked to and the last heartbeat was answered.
fn serve_enable_request(shared: &Shared) {
    if !shared.enable_requested.load(Ordering::SeqCst) || shared.lock_liveness().missed > 0 {
        return;
    }

    shared.enable_requested.store(false, Ordering::SeqCst);

    if shared.is_enabled() {
        return;
    }

    if let Err(e) = shared.arm() {
        warn!("Requested enable failed: {}", e);
    }
}

/// Sleep for up to `duration` in short slices, returning early once the running flag clears.
fn sleep_while_running(shared: &Shared, duration: Option<Duration>) {
    let deadline = match duration {
        Some(d) => Instant::now() + d,
        None => return,
    };

    while shared.is_running() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(MAX_SLEEP_SLICE));
    }
}
