use std::path::Path;
use std::time::Duration;

use config_file::FromConfigFile;
use serde::Deserialize;
use tracing::info;

use crate::error::{Result, SlotCarError};
use crate::space::{ActionShape, StateShape};
use crate::track::FeatureKind;

/// Hold information read from the TOML configuration file.
///
/// Every section is optional; missing keys fall back to the values the physical
/// track was tuned with.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct SlotCarConfig {
    pub learning: LearningConfig,
    pub state_shape: StateShape,
    pub action_shape: ActionShape,
    pub reward: RewardConfig,
    pub control: ControlConfig,
    pub camera: CameraConfig,
    pub hall: HallConfig,
    pub servo: ServoConfig,
    pub simulation: SimulationConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LearningConfig {
    /// Alpha
    pub learning_rate: f64,
    /// Gamma
    pub discount_factor: f64,
    /// Training iterations until exploration stops
    pub max_exploring_iterations: u64,
    pub seed: Option<u64>,
    /// What a new run (after a deslot) starts from
    pub run_reset: RunReset,
}

/// Agent state cleared when a new training run starts. The table is never cleared.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunReset {
    /// Reward total, training iterations and exploration probability
    #[default]
    Full,
    /// Reward total only; exploration keeps decaying across runs
    RewardOnly,
}

impl Default for LearningConfig {
    fn default() -> Self {
        LearningConfig {
            learning_rate: 0.1,
            discount_factor: 0.9,
            max_exploring_iterations: 1_000_000,
            seed: None,
            run_reset: RunReset::Full,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RewardConfig {
    /// Arbitrary starting value of the running total
    pub initial_total: f64,
    /// Multiplier applied to the running total on a deslot
    pub deslot_factor: f64,
    pub speed_weight: f64,
    pub lap_weight: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        RewardConfig {
            initial_total: 2000.0,
            deslot_factor: 0.5,
            speed_weight: 0.1,
            lap_weight: 10.0,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ControlConfig {
    /// Wait between applying an action and measuring its result
    pub dwell_ms: u64,
    /// Start the next run by itself once the car is back after a deslot
    pub auto_resume: bool,
}

impl ControlConfig {
    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig { dwell_ms: 300, auto_resume: true }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CameraConfig {
    /// Track is 2000 mm wide and 1442 pixels wide on the camera
    pub mm_per_pixel: f64,
    pub min_features: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig { mm_per_pixel: 2000.0 / 1442.0, min_features: 2 }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HallConfig {
    pub magnet_distance_mm: f64,
    pub num_sensors: usize,
    pub start_finish_sensor: u8,
    /// Largest accepted gap between camera and hall speeds
    pub speed_tolerance_mm_s: f64,
    /// Hall readings older than this (relative to the camera sample) are not compared
    pub max_time_between_ms: u64,
}

impl Default for HallConfig {
    fn default() -> Self {
        HallConfig {
            magnet_distance_mm: 88.0,
            num_sensors: 2,
            start_finish_sensor: 2,
            speed_tolerance_mm_s: 200.0,
            max_time_between_ms: 50,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServoConfig {
    pub min_angle: i32,
    pub max_angle: i32,
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig { min_angle: 30, max_angle: 90 }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SimulationConfig {
    /// Speed reached at full throttle
    pub top_speed: f64,
    /// Half-width of the uniform noise added to every speed
    pub speed_noise: f64,
    /// Distance between consecutive corners
    pub segment_length: f64,
    pub distance_per_speed_unit: f64,
    /// Simulated time covered by one action
    pub time_step_ms: u64,
    pub corners: Vec<FeatureKind>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            top_speed: 990.0,
            speed_noise: 10.0,
            segment_length: 99.0,
            distance_per_speed_unit: 0.1,
            time_step_ms: 200,
            corners: vec![
                FeatureKind::Straight,
                FeatureKind::Turn,
                FeatureKind::Turn,
                FeatureKind::Straight,
                FeatureKind::Turn,
                FeatureKind::Turn,
            ],
        }
    }
}

impl SlotCarConfig {
    pub fn load(path: &Path) -> Result<SlotCarConfig> {
        info!(path = %path.display(), "reading config file");
        let config = SlotCarConfig::from_config_file(path).map_err(|e| SlotCarError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the learning hyperparameters. Shapes are checked when the table is built.
    pub fn validate(&self) -> Result<()> {
        let learning = &self.learning;
        check_unit_interval("learning.learning_rate", learning.learning_rate)?;
        check_unit_interval("learning.discount_factor", learning.discount_factor)?;
        if learning.max_exploring_iterations == 0 {
            return Err(SlotCarError::ConfigInvalid {
                field: "learning.max_exploring_iterations",
                reason: String::from("must be > 0"),
            });
        }
        if self.simulation.corners.is_empty() {
            return Err(SlotCarError::ConfigInvalid {
                field: "simulation.corners",
                reason: String::from("at least one corner is needed"),
            });
        }
        if self.simulation.time_step_ms == 0 {
            return Err(SlotCarError::ConfigInvalid {
                field: "simulation.time_step_ms",
                reason: String::from("must be > 0"),
            });
        }
        if self.servo.min_angle >= self.servo.max_angle {
            return Err(SlotCarError::ConfigInvalid {
                field: "servo.min_angle",
                reason: format!("must be below max_angle {}", self.servo.max_angle),
            });
        }
        Ok(())
    }
}

fn check_unit_interval(field: &'static str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SlotCarError::ConfigInvalid {
            field,
            reason: format!("{value} is not in [0, 1]"),
        })
    }
}
