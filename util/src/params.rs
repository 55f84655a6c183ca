//! Generic parameters functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::de::DeserializeOwned;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toml;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// An error that occurs during loading of a parameter file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("The software root environment variable (PATROL_SW_ROOT) is not set")]
    SwRootNotSet,

    #[error("Cannot load the parameter file {0:?}: {1}")]
    FileLoadError(PathBuf, std::io::Error),

    #[error("Cannot read the parameter file: {0}")]
    DeserialiseError(toml::de::Error)
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Load a parameter file
///
/// The file path is relative to the "$PATROL_SW_ROOT/params" directory
pub fn load<P>(param_file_path: &str) -> Result<P, LoadError> 
where
    P: DeserializeOwned
{
    // Get the params dir
    let mut path = crate::host::get_sw_root()
        .map_err(|_| LoadError::SwRootNotSet)?;
    path.push("params");
    path.push(param_file_path);

    load_from(path)
}

/// Load a parameter file from an explicit path
pub fn load_from<P, F>(path: F) -> Result<P, LoadError>
where
    P: DeserializeOwned,
    F: AsRef<Path>
{
    // Load the file into a string
    let params_str = match read_to_string(path.as_ref()) {
        Ok(s) => s,
        Err(e) => return Err(LoadError::FileLoadError(path.as_ref().to_path_buf(), e))
    };

    from_str(&params_str)
}

/// Parse parameters from a TOML string
pub fn from_str<P>(params_str: &str) -> Result<P, LoadError>
where
    P: DeserializeOwned
{
    match toml::from_str(params_str) {
        Ok(p) => Ok(p),
        Err(e) => Err(LoadError::DeserialiseError(e))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct TestParams {
        rate_hz: f64,
        #[serde(default)]
        name: String,
    }

    #[test]
    fn test_from_str() {
        let p: TestParams = from_str("rate_hz = 10.0\nname = \"sender\"").unwrap();
        assert_eq!(p, TestParams { rate_hz: 10.0, name: "sender".into() });

        let p: TestParams = from_str("rate_hz = 2.5").unwrap();
        assert_eq!(p.name, "");

        assert!(matches!(
            from_str::<TestParams>("rate_hz = \"fast\""),
            Err(LoadError::DeserialiseError(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            load_from::<TestParams, _>("/definitely/not/a/params.toml"),
            Err(LoadError::FileLoadError(_, _))
        ));
    }
}
