//! # Microcontroller serial protocol
//!
//! Line-oriented ASCII protocol spoken between the control computer and the chassis
//! microcontroller. Every frame is a single line terminated by `\n`.
//!
//! Outbound commands are a single letter optionally followed by a signed integer. Physical
//! quantities (m/s, rad/s, m, rad) are scaled by 1000 and truncated toward zero, so a velocity
//! of 0.8 m/s is sent as `V800` and a yaw rate of -0.3 rad/s as `Y-300`.
//!
//! Inbound lines are either telemetry (`F<v>,<x>,<yaw>,<yaw_rate>`) or acknowledgements
//! (`OK...`, `ERR`, `!`).

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Scale applied to physical quantities before they are framed.
pub const FIXED_POINT_SCALE: f64 = 1000.0;

/// Line terminator used in both directions.
pub const LINE_TERMINATOR: char = '\n';

/// Sigil which prefixes a telemetry line.
const FEEDBACK_SIGIL: char = 'F';

/// Minimum number of fields in a telemetry line.
const NUM_FEEDBACK_FIELDS: usize = 4;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// A single command to the microcontroller.
///
/// Commands are immutable once created and consumed exactly once by a transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Arm the actuators (`E1`)
    Enable,

    /// Disarm the actuators (`E0`)
    Disable,

    /// Forward velocity demand in m/s (`V`)
    Velocity(f64),

    /// Yaw rate demand in rad/s (`Y`)
    YawRate(f64),

    /// Leg height demand in m (`H`)
    LegHeight(f64),

    /// Body roll demand in rad (`R`)
    Roll(f64),

    /// Trigger a jump (`J1`)
    Jump,

    /// Raw PWM test value, sent unscaled (`C`)
    Pwm(i32),

    /// Buzzer pattern (`B`)
    Buzzer(BuzzerCmd),

    /// Liveness check (`?`)
    Heartbeat,
}

/// Patterns the on-board buzzer can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuzzerCmd {
    Off,
    Beep,
    Alarm,
}

/// Classification of a single inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Nothing but whitespace
    Empty,

    /// A decoded telemetry line
    Feedback(RobotFeedback),

    /// A telemetry line which could not be decoded
    BadFeedback(FeedbackParseError),

    /// Positive acknowledgement (`OK`, possibly followed by text)
    Ok,

    /// Negative acknowledgement (`ERR`)
    Err,

    /// Heartbeat acknowledgement (`!`)
    HeartbeatAck,

    /// Anything else
    Other(String),
}

/// Errors which occur while decoding a telemetry line.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedbackParseError {
    #[error("Expected the line to start with 'F', found {0:?}")]
    MissingSigil(String),

    #[error("Expected at least 4 fields, found {0}")]
    TooFewFields(usize),

    #[error("Field {0} ({1:?}) is not a valid number")]
    InvalidField(usize, String),
}

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Most recent telemetry reported by the microcontroller.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RobotFeedback {
    /// Measured forward velocity (m/s)
    pub velocity_ms: f64,

    /// Integrated position along the forward axis (m)
    pub position_m: f64,

    /// Heading (rad)
    pub yaw_rad: f64,

    /// Measured yaw rate (rad/s)
    pub yaw_rate_rads: f64,

    /// Time the telemetry was received, `None` until the first valid line
    pub timestamp: Option<DateTime<Utc>>,

    /// True once the record holds decoded telemetry
    pub valid: bool,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Command {
    /// Encode the command as a line ready for transmission, including the terminator.
    pub fn encode(&self) -> String {
        format!("{}{}", self, LINE_TERMINATOR)
    }

    /// True for commands that actuate the chassis and must only be sent while enabled.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            Command::Velocity(_)
                | Command::YawRate(_)
                | Command::LegHeight(_)
                | Command::Roll(_)
                | Command::Jump
        )
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Enable => write!(f, "E1"),
            Command::Disable => write!(f, "E0"),
            Command::Velocity(v) => write!(f, "V{}", to_fixed(*v)),
            Command::YawRate(y) => write!(f, "Y{}", to_fixed(*y)),
            Command::LegHeight(h) => write!(f, "H{}", to_fixed(*h)),
            Command::Roll(r) => write!(f, "R{}", to_fixed(*r)),
            Command::Jump => write!(f, "J1"),
            Command::Pwm(p) => write!(f, "C{}", p),
            Command::Buzzer(b) => write!(f, "B{}", b.code()),
            Command::Heartbeat => write!(f, "?"),
        }
    }
}

impl BuzzerCmd {
    fn code(&self) -> u8 {
        match self {
            BuzzerCmd::Off => 0,
            BuzzerCmd::Beep => 1,
            BuzzerCmd::Alarm => 2,
        }
    }
}

impl Inbound {
    /// Classify a single line received from the microcontroller.
    pub fn classify(line: &str) -> Self {
        let line = line.trim();

        if line.is_empty() {
            Inbound::Empty
        } else if line.starts_with(FEEDBACK_SIGIL) {
            match RobotFeedback::from_line(line) {
                Ok(fb) => Inbound::Feedback(fb),
                Err(e) => Inbound::BadFeedback(e),
            }
        } else if line.starts_with("OK") {
            Inbound::Ok
        } else if line == "ERR" {
            Inbound::Err
        } else if line.starts_with('!') {
            Inbound::HeartbeatAck
        } else {
            Inbound::Other(line.to_string())
        }
    }

    /// True if this line is a recognised response from the microcontroller.
    pub fn is_recognised(&self) -> bool {
        matches!(
            self,
            Inbound::Feedback(_) | Inbound::Ok | Inbound::Err | Inbound::HeartbeatAck
        )
    }
}

impl RobotFeedback {
    /// Decode a telemetry line of the form `F<v>,<x>,<yaw>,<yaw_rate>`.
    ///
    /// Fields beyond the fourth are ignored. The returned record is marked valid and stamped
    /// with the current time.
    pub fn from_line(line: &str) -> Result<Self, FeedbackParseError> {
        let line = line.trim();

        let body = match line.strip_prefix(FEEDBACK_SIGIL) {
            Some(b) => b,
            None => return Err(FeedbackParseError::MissingSigil(line.to_string())),
        };

        let fields: Vec<&str> = body.split(',').collect();
        if fields.len() < NUM_FEEDBACK_FIELDS {
            return Err(FeedbackParseError::TooFewFields(fields.len()));
        }

        let mut values = [0f64; NUM_FEEDBACK_FIELDS];
        for (i, field) in fields.iter().take(NUM_FEEDBACK_FIELDS).enumerate() {
            values[i] = field
                .trim()
                .parse()
                .map_err(|_| FeedbackParseError::InvalidField(i, field.to_string()))?;
        }

        Ok(RobotFeedback {
            velocity_ms: values[0],
            position_m: values[1],
            yaw_rad: values[2],
            yaw_rate_rads: values[3],
            timestamp: Some(Utc::now()),
            valid: true,
        })
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Scale a physical value into its fixed point representation, truncating toward zero.
fn to_fixed(value: f64) -> i64 {
    (value * FIXED_POINT_SCALE) as i64
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode_numeric() {
        assert_eq!(Command::Velocity(0.8).encode(), "V800\n");
        assert_eq!(Command::YawRate(-0.3).encode(), "Y-300\n");
        assert_eq!(Command::LegHeight(0.15).encode(), "H150\n");
        assert_eq!(Command::Roll(-0.1).encode(), "R-100\n");
        assert_eq!(Command::Pwm(1500).encode(), "C1500\n");
    }

    #[test]
    fn test_encode_truncates_toward_zero() {
        assert_eq!(Command::Velocity(0.0009).to_string(), "V0");
        assert_eq!(Command::Velocity(-0.0009).to_string(), "V0");
        assert_eq!(Command::YawRate(1.2345).to_string(), "Y1234");
        assert_eq!(Command::YawRate(-1.2345).to_string(), "Y-1234");
    }

    #[test]
    fn test_encode_literals() {
        assert_eq!(Command::Enable.encode(), "E1\n");
        assert_eq!(Command::Disable.encode(), "E0\n");
        assert_eq!(Command::Jump.encode(), "J1\n");
        assert_eq!(Command::Heartbeat.encode(), "?\n");
        assert_eq!(Command::Buzzer(BuzzerCmd::Off).encode(), "B0\n");
        assert_eq!(Command::Buzzer(BuzzerCmd::Alarm).encode(), "B2\n");
    }

    #[test]
    fn test_is_motion() {
        assert!(Command::Velocity(0.0).is_motion());
        assert!(Command::Jump.is_motion());
        assert!(!Command::Enable.is_motion());
        assert!(!Command::Disable.is_motion());
        assert!(!Command::Heartbeat.is_motion());
        assert!(!Command::Pwm(0).is_motion());
    }

    #[test]
    fn test_decode_feedback() {
        let fb = RobotFeedback::from_line("F0.50,1.00,0.78,0.10").unwrap();

        assert_eq!(fb.velocity_ms, 0.50);
        assert_eq!(fb.position_m, 1.00);
        assert_eq!(fb.yaw_rad, 0.78);
        assert_eq!(fb.yaw_rate_rads, 0.10);
        assert!(fb.valid);
        assert!(fb.timestamp.is_some());

        // Extra fields and trailing whitespace are tolerated
        let fb = RobotFeedback::from_line("F-1,2,3,4,99\r\n").unwrap();
        assert_eq!(fb.velocity_ms, -1.0);
        assert_eq!(fb.yaw_rate_rads, 4.0);
    }

    #[test]
    fn test_decode_feedback_errors() {
        assert_eq!(
            RobotFeedback::from_line("0.5,1,2,3"),
            Err(FeedbackParseError::MissingSigil("0.5,1,2,3".into()))
        );
        assert_eq!(
            RobotFeedback::from_line("F0.5,1.0,2.0"),
            Err(FeedbackParseError::TooFewFields(3))
        );
        assert_eq!(
            RobotFeedback::from_line("F0.5,abc,2.0,3.0"),
            Err(FeedbackParseError::InvalidField(1, "abc".into()))
        );
        assert!(!RobotFeedback::default().valid);
    }

    #[test]
    fn test_classify() {
        assert_eq!(Inbound::classify("  \r"), Inbound::Empty);
        assert_eq!(Inbound::classify("OK"), Inbound::Ok);
        assert_eq!(Inbound::classify("OK V800"), Inbound::Ok);
        assert_eq!(Inbound::classify("ERR"), Inbound::Err);
        assert_eq!(Inbound::classify("!"), Inbound::HeartbeatAck);
        assert_eq!(Inbound::classify("hello"), Inbound::Other("hello".into()));
        assert!(matches!(Inbound::classify("F1,2,3,4"), Inbound::Feedback(_)));
        assert!(matches!(Inbound::classify("Fx"), Inbound::BadFeedback(_)));

        assert!(Inbound::classify("!").is_recognised());
        assert!(!Inbound::classify("hello").is_recognised());
        assert!(!Inbound::classify("Fx").is_recognised());
    }
}
