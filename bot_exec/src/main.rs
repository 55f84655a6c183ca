//! Main bot executable entry point.
//!
//! # Architecture
//!
//! The general execution methodology consists of:
//!
//!     - Initialise the session, logging and parameters
//!     - Connect to the microcontroller and enable motor control
//!     - Main loop:
//!         - Perception input acquisition (scripted frames, or blind frames if no script)
//!         - Link health monitoring and re-enabling
//!         - Mode processing
//!         - Alarm handling for intruder alerts
//!     - Shutdown: silence the buzzer, emergency stop, disconnect
//!
//! The exec runs until the end of the perception script, or until the requested duration has
//! elapsed.

// ------------------------------------------------------------------------------------------------
// USE MODULES FROM LIBRARY
// ------------------------------------------------------------------------------------------------

use bot_lib::{
    alarm::Alarm,
    data_store::{DataStore, SafeModeCause},
    driver::{self, ActiveMode, ModeKind, MotionSink},
    modes::{patrol::Intruder, ModesParams},
    params::BotExecParams,
    uart_ctrl::{MockTransport, UartCtrl, UartCtrlError, UartCtrlParams},
};

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

// External
use color_eyre::{
    eyre::{eyre, WrapErr},
    Report,
};
use comms_if::per::Frame;
use crossbeam_channel::{unbounded, Receiver};
use log::{debug, error, info, trace, warn};
use std::path::PathBuf;
use std::thread;
use std::time::Instant;
use structopt::StructOpt;

// Internal
use util::{
    host,
    logger::{level_from_debug_flag, logger_init},
    script_interpreter::{PendingFrames, ScriptInterpreter},
    session::Session,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Security patrol robot executable.
#[derive(Debug, StructOpt)]
#[structopt(name = "bot_exec")]
struct Opts {
    /// Use a simulated microcontroller instead of the serial port
    #[structopt(long)]
    mock_uart: bool,

    /// Run without any microcontroller, demands are only logged. Takes priority over --mock-uart
    #[structopt(long)]
    no_uart: bool,

    /// Serial port, overrides the value in uart_ctrl.toml
    #[structopt(long)]
    port: Option<String>,

    /// Mode to run: patrol, line_follow or obj_track
    #[structopt(long)]
    mode: Option<ModeKind>,

    /// Stop after this many seconds
    #[structopt(long)]
    duration: Option<f64>,

    /// Enable trace level logging
    #[structopt(long)]
    debug: bool,

    /// Perception script to replay
    #[structopt(parse(from_os_str))]
    script: Option<PathBuf>,
}

/// Stands in for the controller when running without a microcontroller.
struct DrySink;

// ------------------------------------------------------------------------------------------------
// ENUMERATIONS
// ------------------------------------------------------------------------------------------------

/// Various sources for the perception frames given to the mode.
enum FrameSource {
    /// Empty frames of a fixed size, so that timed behaviours still run
    Blind { width: u32, height: u32 },
    Script(ScriptInterpreter),
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let opts = Opts::from_args();

    // ---- LOAD PARAMETERS ----

    let exec_params: BotExecParams =
        util::params::load("bot_exec.toml").wrap_err("Could not load bot_exec params")?;
    exec_params
        .are_valid()
        .map_err(|e| eyre!(e))
        .wrap_err("Invalid bot_exec params")?;

    let modes_params: ModesParams =
        util::params::load("modes.toml").wrap_err("Could not load modes params")?;
    modes_params
        .are_valid()
        .map_err(|e| eyre!(e))
        .wrap_err("Invalid modes params")?;

    let mut uart_params: UartCtrlParams =
        util::params::load("uart_ctrl.toml").wrap_err("Could not load uart_ctrl params")?;
    if let Some(port) = opts.port.as_ref() {
        uart_params.port = port.clone();
    }

    // ---- EARLY INITIALISATION ----

    // Initialise session
    let session = Session::new("bot_exec", &exec_params.sessions_dir)
        .wrap_err("Failed to create the session")?;

    // Initialise logger
    logger_init(level_from_debug_flag(opts.debug), &session)
        .wrap_err("Failed to initialise logging")?;

    // Log information on this execution.
    info!("Patrol Bot Executable\n");
    info!(
        "Running on: {}",
        host::get_hostname().unwrap_or_else(|| String::from("unknown host"))
    );
    info!("Session directory: {:?}\n", session.session_root);
    debug!("CLI options: {:?}", opts);

    // ---- INITIALISE FRAME SOURCE ----

    let mut frame_source = match opts.script.as_ref() {
        Some(path) => {
            info!("Loading perception script from {:?}", path);

            let si = ScriptInterpreter::new(path).wrap_err("Failed to load script")?;

            info!(
                "Loaded script lasts {:.02} s and contains {} frames\n",
                si.get_duration(),
                si.get_num_frames()
            );

            FrameSource::Script(si)
        }
        None => {
            info!("No script provided, running on blind frames\n");
            FrameSource::Blind {
                width: exec_params.blind_frame_width,
                height: exec_params.blind_frame_height,
            }
        }
    };

    // ---- INITIALISE DATASTORE ----

    info!("Initialising modules...");

    let mut ds = DataStore::default();

    // ---- INITIALISE MODES ----

    let mode_kind = match opts.mode {
        Some(k) => k,
        None => exec_params
            .default_mode
            .parse::<ModeKind>()
            .map_err(|e| eyre!(e))
            .wrap_err("Invalid default mode in bot_exec params")?,
    };

    let mut mode = ActiveMode::new(mode_kind, &modes_params);

    let alerts = match mode.patrol_mut() {
        Some(patrol) => {
            let (tx, rx) = unbounded::<Intruder>();
            patrol.set_alert_callback(Box::new(move |i| {
                // The receiver lives until shutdown
                tx.send(i.clone()).ok();
            }));
            Some(rx)
        }
        None => None,
    };

    let mut alarm = Alarm::new(exec_params.alarm.clone());

    info!("{} mode initialised", mode);

    // ---- INITIALISE UART ----

    let mut uart_ctrl = if opts.no_uart {
        info!("Running without a microcontroller");
        None
    } else {
        let mut ctrl = UartCtrl::new(uart_params).wrap_err("Failed to initialise UartCtrl")?;

        let connect_result = if opts.mock_uart {
            info!("Using a simulated microcontroller");
            ctrl.connect_with(Box::new(MockTransport::new()))
        } else {
            ctrl.connect()
        };

        match connect_result {
            Ok(()) => {
                info!("UartCtrl connected");
                match ctrl.enable_control() {
                    Ok(()) => info!("Motor control enabled"),
                    Err(e) => warn!("Could not enable motor control: {}", e),
                }
            }
            // Not being able to open the port is fatal, anything else is retried in the loop
            Err(e @ UartCtrlError::OpenError(..)) => {
                return Err(e).wrap_err("Failed to connect to the microcontroller")
            }
            Err(e) => warn!("UartCtrl connection problem: {}", e),
        }

        Some(ctrl)
    };

    mode.restart();

    info!("Module initialisation complete\n");

    // ---- MAIN LOOP ----

    info!("Begining main loop\n");

    let cycle_period = exec_params.cycle_period();
    let loop_start = Instant::now();

    loop {
        // Get cycle start time
        let cycle_start_instant = Instant::now();
        let loop_time_s = (cycle_start_instant - loop_start).as_secs_f64();

        // Clear items that need wiping at the start of the cycle
        ds.cycle_start(exec_params.cycle_frequency_hz());

        if let Some(limit) = opts.duration {
            if loop_time_s >= limit {
                info!("Requested duration of {:.1} s reached, stopping", limit);
                break;
            }
        }

        // ---- PERCEPTION INPUT ----

        let frames = match frame_source {
            FrameSource::Blind { width, height } => vec![Frame {
                timestamp_s: loop_time_s,
                width,
                height,
                ..Default::default()
            }],
            FrameSource::Script(ref mut si) => match si.get_pending_frames(loop_time_s) {
                PendingFrames::None => vec![],
                PendingFrames::Some(f) => f,
                PendingFrames::EndOfScript => {
                    info!("End of perception script reached, stopping");
                    break;
                }
            },
        };

        // ---- LINK MONITORING ----

        if let Some(ctrl) = uart_ctrl.as_ref() {
            monitor_link(ctrl, &mut ds);

            let fb = ctrl.get_feedback();
            if fb.valid {
                ds.feedback = Some(fb);
            }
        }

        // ---- MODE PROCESSING ----

        for frame in frames.iter() {
            ds.num_frames += 1;

            let output = match uart_ctrl.as_mut() {
                Some(ctrl) => driver::step(
                    mode.as_mode_mut(),
                    ctrl,
                    frame,
                    None,
                    ds.feedback.as_ref(),
                ),
                None => driver::step(
                    mode.as_mode_mut(),
                    &mut DrySink,
                    frame,
                    None,
                    ds.feedback.as_ref(),
                ),
            };

            if output.emergency_stop {
                ds.make_safe(SafeModeCause::EmergencyStop);
            }

            debug!(
                "{} [{}]: v = {:.2} m/s, yaw = {:.2} rad/s, {}",
                mode, output.state, output.velocity_ms, output.yaw_rate_rads, output.message
            );

            if let Some(overlay) = output.overlay.as_ref() {
                match serde_json::to_string(overlay) {
                    Ok(s) => trace!("Overlay: {}", s),
                    Err(e) => warn!("Could not serialise the overlay: {}", e),
                }
            }

            ds.mode_output = Some(output);
        }

        // ---- ALARM ----

        if let Some(rx) = alerts.as_ref() {
            handle_alerts(rx, &mut alarm, uart_ctrl.as_ref(), ds.session_time_s);
        }

        // ---- CYCLE MANAGEMENT ----

        let cycle_dur = Instant::now() - cycle_start_instant;

        // Get sleep duration
        match cycle_period.checked_sub(cycle_dur) {
            Some(d) => {
                ds.num_consec_cycle_overruns = 0;
                thread::sleep(d);
            }
            None => {
                warn!(
                    "Cycle overran by {:.06} s",
                    cycle_dur.as_secs_f64() - cycle_period.as_secs_f64()
                );
                ds.num_consec_cycle_overruns += 1;

                if ds.num_consec_cycle_overruns > exec_params.max_consec_cycle_overruns {
                    error!(
                        "More than {} consecutive cycle overruns, stopping",
                        exec_params.max_consec_cycle_overruns
                    );
                    break;
                }
            }
        }

        ds.cycle_end();
    }

    // ---- SHUTDOWN ----

    info!("Shutting down");

    if let Some(mut ctrl) = uart_ctrl.take() {
        if let Err(e) = ctrl.send_buzzer(alarm.reset()) {
            debug!("Could not silence the buzzer: {}", e);
        }
        ctrl.send_emergency_stop();
        ctrl.disconnect();
    }

    mode.as_mode_mut().disable();

    info!(
        "Ran {} cycles and processed {} frames",
        ds.num_cycles, ds.num_frames
    );

    if let Some(patrol) = mode.patrol() {
        let history = patrol.intruder_history();
        info!("Intruders detected: {}", history.len());
        for (i, intruder) in history.iter().enumerate() {
            info!(
                "    {}: t = {:.1} s, {:.1} m away, confidence {:.0}%",
                i + 1,
                intruder.timestamp_s,
                intruder.distance_m,
                intruder.confidence * 100.0
            );
        }
    }

    info!("End of execution");

    Ok(())
}

/// Keep the safe mode flags in line with the link state, and ask for control to be re-enabled
/// once a second if the link is up but control has been disabled.
fn monitor_link(ctrl: &UartCtrl, ds: &mut DataStore) {
    if !ctrl.is_connected() {
        if !ds.safe {
            error!("Microcontroller not connected");
        }
        ds.make_safe(SafeModeCause::UartNotConnected);
        return;
    }

    ds.make_unsafe(SafeModeCause::UartNotConnected).ok();

    if ctrl.is_enabled() {
        ds.make_unsafe(SafeModeCause::ControlDisabled).ok();
        return;
    }

    ds.make_safe(SafeModeCause::ControlDisabled);

    if ds.is_1_hz_cycle {
        let health = ctrl.get_connection_health();

        // Armed by the watchdog, picked up by a later cycle once is_enabled() reports it
        if health.healthy {
            info!("Link healthy, requesting motor control re-enable");
            if let Err(e) = ctrl.request_enable() {
                warn!("Could not request motor control re-enable: {}", e);
            }
        } else {
            debug!(
                "Link unhealthy ({} missed heartbeats), not re-enabling",
                health.missed_heartbeats
            );
        }
    }
}

/// Drain the patrol alerts and drive the buzzer from them.
fn handle_alerts(
    rx: &Receiver<Intruder>,
    alarm: &mut Alarm,
    ctrl: Option<&UartCtrl>,
    now_s: f64,
) {
    for intruder in rx.try_iter() {
        let action = alarm.on_intruder(&intruder, now_s);

        let ctrl = match ctrl {
            Some(c) => c,
            None => continue,
        };

        if let Some(cmd) = action.buzzer {
            if let Err(e) = ctrl.send_buzzer(cmd) {
                warn!("Could not sound the buzzer: {}", e);
            }
        }

        if action.stop_motion && ctrl.is_enabled() {
            if let Err(e) = ctrl.send_motion_command(0.0, 0.0, None, None) {
                warn!("Could not stop for the intruder: {}", e);
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// ------------------------------------------------------------------------------------------------

impl MotionSink for DrySink {
    fn is_enabled(&self) -> bool {
        true
    }

    fn pending(&self) -> usize {
        0
    }

    fn send_motion(&mut self, velocity_ms: f64, yaw_rate_rads: f64) -> Result<(), UartCtrlError> {
        debug!("Dry run demand: v = {:.2} m/s, yaw = {:.2} rad/s", velocity_ms, yaw_rate_rads);
        Ok(())
    }

    fn emergency_stop(&mut self) {
        warn!("Dry run emergency stop");
    }
}
