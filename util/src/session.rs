//! # Sessions
//!
//! A session is one run of an executable. It owns a directory under the sessions directory, named
//! from the executable and the wall clock time the session started, which holds the log file and
//! anything else the run wants to keep.
//!
//! The start time is also the epoch used for log timestamps, so only one session may be started
//! per process.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use conquer_once::OnceCell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::time;

// ---------------------------------------------------------------------------
// STATICS
// ---------------------------------------------------------------------------

static SESSION_EPOCH: OnceCell<DateTime<Utc>> = OnceCell::uninit();

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Format of the start time in a session directory name.
const DIR_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Number of suffixed names tried before giving up on finding a free directory.
const MAX_DIR_SUFFIX: u32 = 100;

// ---------------------------------------------------------------------------
// STRUCTS
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Session {
    /// Name of the session directory, `{exec_name}_{timestamp}` with a `_{n}` suffix if another
    /// session already took that name
    pub name: String,

    /// Wall clock time the session started
    pub epoch: DateTime<Utc>,

    pub session_root: PathBuf,

    /// `{exec_name}.log` in the session directory
    pub log_file_path: PathBuf,
}

// ---------------------------------------------------------------------------
// ENUMS
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("The software root environment variable (PATROL_SW_ROOT) is not set")]
    SwRootNotSet,

    #[error("A session has already been started in this process")]
    AlreadyStarted,

    #[error("Cannot create the session directory {0:?}: {1}")]
    CannotCreateDir(PathBuf, io::Error),

    #[error("No free session directory name for {0:?}")]
    NoFreeDirName(PathBuf),
}

// ---------------------------------------------------------------------------
// IMPLS
// ---------------------------------------------------------------------------

impl Session {
    /// Start the session in `sessions_dir` under the software root.
    pub fn new(exec_name: &str, sessions_dir: &str) -> Result<Self, SessionError> {
        let root = crate::host::get_sw_root().map_err(|_| SessionError::SwRootNotSet)?;

        Self::start_in(&root.join(sessions_dir), exec_name)
    }

    /// Start the session in the given directory, creating it if needed.
    pub fn start_in(sessions_dir: &Path, exec_name: &str) -> Result<Self, SessionError> {
        SESSION_EPOCH
            .try_init_once(Utc::now)
            .map_err(|_| SessionError::AlreadyStarted)?;
        let epoch = *SESSION_EPOCH.get().ok_or(SessionError::AlreadyStarted)?;

        Self::create(sessions_dir, exec_name, epoch)
    }

    /// Create the session directory without touching the process epoch.
    fn create(
        sessions_dir: &Path,
        exec_name: &str,
        epoch: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        fs::create_dir_all(sessions_dir)
            .map_err(|e| SessionError::CannotCreateDir(sessions_dir.to_path_buf(), e))?;

        let base = dir_name(exec_name, &epoch);
        let (name, session_root) = create_unique_dir(sessions_dir, &base)?;
        let log_file_path = session_root.join(format!("{}.log", exec_name));

        Ok(Session {
            name,
            epoch,
            session_root,
            log_file_path,
        })
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Seconds since the session started, or `None` before any session has started.
pub fn elapsed_seconds() -> Option<f64> {
    SESSION_EPOCH
        .get()
        .and_then(|e| time::duration_to_seconds(Utc::now() - *e))
}

/// Seconds since the session started, zero before any session has started.
pub fn get_elapsed_seconds() -> f64 {
    elapsed_seconds().unwrap_or(0.0)
}

/// Returns true once a session has been started in this process.
pub fn is_initialised() -> bool {
    SESSION_EPOCH.get().is_some()
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn dir_name(exec_name: &str, epoch: &DateTime<Utc>) -> String {
    format!("{}_{}", exec_name, epoch.format(DIR_TIMESTAMP_FORMAT))
}

/// Create `base` in `parent`, or `base_1`, `base_2`... if it is taken.
fn create_unique_dir(parent: &Path, base: &str) -> Result<(String, PathBuf), SessionError> {
    for n in 0..MAX_DIR_SUFFIX {
        let name = match n {
            0 => base.to_string(),
            n => format!("{}_{}", base, n),
        };
        let path = parent.join(&name);

        match fs::create_dir(&path) {
            Ok(()) => return Ok((name, path)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(SessionError::CannotCreateDir(path, e)),
        }
    }

    Err(SessionError::NoFreeDirName(parent.join(base)))
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
