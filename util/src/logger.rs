//! Generic logger utility functions
//!
//! Logs go to stdout with coloured level tags and to the session log file with plain tags. Every
//! record is prefixed with the number of seconds elapsed since the session epoch.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External imports
use log::{self, info};
use fern;
use colored::{ColoredString, Colorize};
use thiserror::Error;

// Internal imports
use crate::session;

// Re-exports
pub use log::LevelFilter;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors associated with initialising the logger.
#[derive(Debug, Error)]
pub enum LoggerInitError {
    #[error("Expected a log level of at least `INFO`, found `{0}`")]
    InvalidMinLogLevel(log::LevelFilter),

    #[error("Error initialising the log file: {0}")]
    LogFileInitError(std::io::Error),

    #[error("An error occured while setting up the logger: {0}")]
    FernInitError(log::SetLoggerError)
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Initialise the logger for this execution.
///
/// # Notes
///
/// - `min_level` must be `Info` or more verbose, warnings and errors are never filtered out.
/// - Serial port internals are capped at `Info`.
///
/// # Safety
///
/// - This function must only be called once to prevent corrupting logs.
pub fn logger_init(
    min_level: self::LevelFilter,
    session: &session::Session
) -> Result<(), LoggerInitError> {

    if min_level < log::Level::Info {
        return Err(LoggerInitError::InvalidMinLogLevel(min_level))
    }

    let log_file = fern::log_file(session.log_file_path.clone())
        .map_err(LoggerInitError::LogFileInitError)?;

    let stdout_dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}",
                format_record(level_to_colored(record.level()), message, record)
            ))
        })
        .chain(std::io::stdout());

    let file_dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}",
                format_record(level_to_str(record.level()), message, record)
            ))
        })
        .chain(log_file);

    fern::Dispatch::new()
        .level(min_level)
        .level_for("serialport", LevelFilter::Info)
        .chain(stdout_dispatch)
        .chain(file_dispatch)
        .apply()
        .map_err(LoggerInitError::FernInitError)?;

    info!("Logging initialised");
    info!("    Session: {} (epoch {})", session.name, session.epoch);
    info!("    Log level: {:?}", min_level);
    info!("    Log file path: {:?}", session.log_file_path);

    Ok(())
}

/// Select the log level from the command line verbosity flag.
pub fn level_from_debug_flag(debug: bool) -> LevelFilter {
    if debug {
        LevelFilter::Trace
    }
    else {
        LevelFilter::Info
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Build the line for one record.
///
/// Debug and trace records include their target module.
fn format_record<T: std::fmt::Display>(
    tag: T,
    message: &std::fmt::Arguments,
    record: &log::Record
) -> String {
    if record.level() > log::Level::Info {
        format!(
            "[{:10.6} {}] {}: {}",
            session::get_elapsed_seconds(),
            tag,
            record.target(),
            message
        )
    }
    else {
        format!(
            "[{:10.6} {}] {}",
            session::get_elapsed_seconds(),
            tag,
            message
        )
    }
}

/// Get the coloured representation of a log level
fn level_to_colored(level: log::Level) -> ColoredString {
    match level {
        log::Level::Trace => "TRC".dimmed().italic(),
        log::Level::Debug => "DBG".dimmed(),
        log::Level::Info  => "INF".normal(),
        log::Level::Warn  => "WRN".yellow(),
        log::Level::Error => "ERR".red().bold()
    }
}

/// Get the plain representation of a log level
fn level_to_str(level: log::Level) -> &'static str {
    match level {
        log::Level::Trace => "TRC",
        log::Level::Debug => "DBG",
        log::Level::Info  => "INF",
        log::Level::Warn  => "WRN",
        log::Level::Error => "ERR"
    }
}
