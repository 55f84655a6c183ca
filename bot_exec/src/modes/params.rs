//! # Mode parameters

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Deserialize;

use super::{line_follow::LineFollowParams, obj_track::ObjTrackParams, patrol::PatrolParams};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters for every mode, loaded from `modes.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModesParams {
    pub patrol: PatrolParams,
    pub line_follow: LineFollowParams,
    pub obj_track: ObjTrackParams,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl ModesParams {
    pub fn are_valid(&self) -> Result<(), String> {
        self.patrol.are_valid()?;
        self.line_follow.are_valid()?;
        self.obj_track.are_valid()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sections() {
        let p: ModesParams = toml::from_str(
            r#"
            [patrol]
            alert_distance_m = 4.0

            [obj_track]
            target_class = "dog"
            "#,
        )
        .unwrap();

        assert_eq!(p.patrol.alert_distance_m, 4.0);
        assert_eq!(p.obj_track.target_class, "dog");
        assert_eq!(p.line_follow.max_frames_lost, 30);
        assert!(p.are_valid().is_ok());
    }
}
