use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the slot-car controller.
///
/// Construction errors (`ShapeInvalid`, `ConfigInvalid`, `InsufficientFeatures`) are fatal.
/// Per-step errors are recoverable: the control loop skips the tick and tries again.
#[derive(Error, Debug)]
pub enum SlotCarError {
    #[error("invalid {axis} shape: {reason} (got {value})")]
    ShapeInvalid {
        axis: &'static str,
        reason: &'static str,
        value: i64,
    },

    #[error("invalid configuration value for {field}: {reason}")]
    ConfigInvalid { field: &'static str, reason: String },

    #[error("state is outside the configured state shape: {0}")]
    StateInvalid(String),

    #[error("action is outside the configured action shape: {0}")]
    ActionInvalid(i32),

    #[error("cannot parse label {0:?}")]
    LabelInvalid(String),

    #[error("measurement unavailable: {0}")]
    MeasurementUnavailable(String),

    #[error("at least {required} track features are needed, found {found}")]
    InsufficientFeatures { found: usize, required: usize },

    #[error(
        "camera speed {camera_mm_s:.0} mm/s and hall speed {hall_mm_s:.0} mm/s \
         differ by more than {tolerance_mm_s:.0} mm/s"
    )]
    SpeedMismatch {
        camera_mm_s: f64,
        hall_mm_s: f64,
        tolerance_mm_s: f64,
    },

    #[error("cannot apply {event} while {from}")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },

    #[error("actuator failure: {0}")]
    Actuator(String),

    #[error("unable to read configuration file {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SlotCarError {
    /// True for errors that only invalidate the current control step.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SlotCarError::StateInvalid(_)
                | SlotCarError::ActionInvalid(_)
                | SlotCarError::MeasurementUnavailable(_)
                | SlotCarError::SpeedMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SlotCarError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(SlotCarError::StateInvalid("200999".into()), true; "Invalid state")]
    #[test_case(SlotCarError::ActionInvalid(91), true; "Invalid action")]
    #[test_case(SlotCarError::MeasurementUnavailable("no frame".into()), true; "No frame")]
    #[test_case(SlotCarError::InsufficientFeatures { found: 1, required: 2 }, false; "One feature")]
    #[test_case(SlotCarError::ShapeInvalid { axis: "action", reason: "step must be > 0", value: 0 }, false; "Zero step")]
    fn classify_errors(err: SlotCarError, recoverable: bool) {
        assert_eq!(err.is_recoverable(), recoverable);
    }
}
