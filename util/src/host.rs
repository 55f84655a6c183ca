//! Host platform utility functions

use std::env;
use std::path::PathBuf;

/// Name of the environment variable pointing at the root of the software checkout.
pub const SW_ROOT_ENV_VAR: &str = "PATROL_SW_ROOT";

/// Get the software root directory, as given by the `PATROL_SW_ROOT` environment variable.
pub fn get_sw_root() -> Result<PathBuf, env::VarError> {
    env::var(SW_ROOT_ENV_VAR).map(PathBuf::from)
}

/// Get the name of the host machine, if the platform exposes it.
pub fn get_hostname() -> Option<String> {
    env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
