//! Vehicle and turret commands.
//!
//! Commands arrive as URL query values and leave as one ASCII line on the
//! serial link. Parsing is strict: a composite drive vector must carry every
//! field exactly once, so a half-formed request never turns into a motion
//! command with silently defaulted axes.

use std::fmt;
use std::str::FromStr;

/// Largest pan step sent for a single pointer update.
pub const MAX_PAN_STEPS: i32 = 10;

/// Pan step used by the turret D-pad.
pub const TURRET_PAN_STEP: i32 = 3;

/// Tilt change in degrees used by the turret D-pad.
pub const TURRET_TILT_STEP_DEGREES: f64 = 5.0;

/// Tilt servo travel in either direction.
pub const TILT_RANGE_DEGREES: f64 = 45.0;

/// Errors produced while parsing a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown directive '{0}'")]
    UnknownDirective(String),

    #[error("malformed field '{0}', expected KEY:VALUE")]
    MalformedField(String),

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("field {0} given more than once")]
    DuplicateField(&'static str),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid value '{value}' for {field}")]
    InvalidValue { field: &'static str, value: String },
}

/// Composite drive/turret vector, sent as `FR:<n>;LR:<n>;UD:<n>;TLR:<n>;FC:<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriveVector {
    /// Forward (positive) / reverse (negative)
    pub forward: i32,
    /// Right (positive) / left (negative) turn
    pub turn: i32,
    /// Vertical axis
    pub vertical: i32,
    /// Turret pan
    pub turret: i32,
    /// Trigger, 0 or 1
    pub fire: i32,
}

impl DriveVector {
    const FIELDS: [&'static str; 5] = ["FR", "LR", "UD", "TLR", "FC"];
}

/// Single-character legacy drive directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyDirective {
    Forward,
    Left,
    Backward,
    Right,
    Stop,
}

impl LegacyDirective {
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'W' => Some(Self::Forward),
            'A' => Some(Self::Left),
            'S' => Some(Self::Backward),
            'D' => Some(Self::Right),
            'X' => Some(Self::Stop),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Forward => 'W',
            Self::Left => 'A',
            Self::Backward => 'S',
            Self::Right => 'D',
            Self::Stop => 'X',
        }
    }
}

/// A directive for the microcontroller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Drive(DriveVector),
    Legacy(LegacyDirective),
    /// Relative turret pan in stepper steps, sent as `P<n>`
    PanStep(i32),
}

impl Command {
    /// The line written to the serial link, without terminator.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Drive(v) => write!(
                f,
                "FR:{};LR:{};UD:{};TLR:{};FC:{}",
                v.forward, v.turn, v.vertical, v.turret, v.fire
            ),
            Command::Legacy(d) => write!(f, "{}", d.as_char()),
            Command::PanStep(steps) => write!(f, "P{}", steps),
        }
    }
}

impl FromStr for Command {
    type Err = CommandError;

    /// Parse the value of a `cmd` query parameter.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CommandError::Empty);
        }

        let mut chars = s.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return LegacyDirective::from_char(c)
                .map(Command::Legacy)
                .ok_or_else(|| CommandError::UnknownDirective(s.to_string()));
        }

        if !s.contains(':') {
            return Err(CommandError::UnknownDirective(s.to_string()));
        }
        parse_drive_vector(s).map(Command::Drive)
    }
}

fn parse_drive_vector(s: &str) -> Result<DriveVector, CommandError> {
    let mut values: [Option<i32>; 5] = [None; 5];

    for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once(':')
            .ok_or_else(|| CommandError::MalformedField(part.to_string()))?;
        let key = key.trim().to_ascii_uppercase();
        let index = DriveVector::FIELDS
            .iter()
            .position(|field| *field == key)
            .ok_or_else(|| CommandError::UnknownField(key.clone()))?;
        let field = DriveVector::FIELDS[index];

        if values[index].is_some() {
            return Err(CommandError::DuplicateField(field));
        }
        let value = value.trim();
        let parsed = value.parse::<i32>().map_err(|_| CommandError::InvalidValue {
            field,
            value: value.to_string(),
        })?;
        values[index] = Some(parsed);
    }

    let take = |index: usize| values[index].ok_or(CommandError::MissingField(DriveVector::FIELDS[index]));
    let vector = DriveVector {
        forward: take(0)?,
        turn: take(1)?,
        vertical: take(2)?,
        turret: take(3)?,
        fire: take(4)?,
    };

    if !(0..=1).contains(&vector.fire) {
        return Err(CommandError::InvalidValue {
            field: "FC",
            value: vector.fire.to_string(),
        });
    }
    Ok(vector)
}

/// Turret D-pad directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurretDirection {
    Left,
    Right,
    Up,
    Down,
}

impl FromStr for TurretDirection {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "L" => Ok(Self::Left),
            "R" => Ok(Self::Right),
            "U" => Ok(Self::Up),
            "D" => Ok(Self::Down),
            "" => Err(CommandError::Empty),
            other => Err(CommandError::UnknownDirective(other.to_string())),
        }
    }
}

/// Pan steps for a horizontal pointer offset from the frame centre.
///
/// Half the frame width maps to [`MAX_PAN_STEPS`]; the result truncates
/// towards zero and is clamped to that range.
pub fn pan_steps_for_offset(x: i32, frame_width: u32) -> i32 {
    let half_width = (frame_width.max(2) / 2) as f64;
    let pixels_per_step = half_width / MAX_PAN_STEPS as f64;
    let steps = (x as f64 / pixels_per_step).trunc() as i32;
    steps.clamp(-MAX_PAN_STEPS, MAX_PAN_STEPS)
}

/// Tilt target in degrees for a vertical pointer offset from the frame centre.
pub fn tilt_for_offset(y: i32, frame_height: u32) -> f64 {
    let half_height = (frame_height.max(2) / 2) as f64;
    (y as f64 / half_height * TILT_RANGE_DEGREES).clamp(-TILT_RANGE_DEGREES, TILT_RANGE_DEGREES)
}
