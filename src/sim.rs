use std::time::Duration;

use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::{Bernoulli, Uniform};
use tracing::{debug, info};

use crate::config::{ServoConfig, SimulationConfig};
use crate::control::{Measurement, Track};
use crate::error::{Result, SlotCarError};
use crate::space::{Action, SpaceEncoder};
use crate::track::FeatureKind;

/// Probability that the car leaves the slot on a turn.
///
/// Depends on the speed just reached and the speed before it. Slow cars stall in turns,
/// which also counts as a deslot. Straights never deslot.
pub fn deslot_probability(speed: f64, previous_speed: f64) -> f64 {
    if speed > 800.0 {
        if previous_speed > 800.0 {
            0.965
        } else if previous_speed < 400.0 {
            0.79
        } else {
            0.65
        }
    } else if speed > 650.0 {
        if previous_speed > 800.0 {
            0.68
        } else if previous_speed < 400.0 {
            0.28
        } else {
            0.2
        }
    } else if speed > 400.0 {
        if previous_speed > 80.0 {
            0.2
        } else {
            0.0
        }
    } else if previous_speed > 800.0 {
        0.96
    } else if previous_speed > 400.0 {
        0.95
    } else {
        0.9
    }
}

/// Offline track used to train without hardware.
///
/// The car drives a loop of corners spaced `segment_length` apart. Speeds and distances
/// are in state units.
#[derive(Debug)]
pub struct SimulatedTrack {
    params: SimulationConfig,
    min_angle: i32,
    max_angle: i32,
    encoder: SpaceEncoder,
    time_step: f64,
    noise: Option<Uniform>,
    rng: StdRng,
    corner: usize,
    distance: f64,
    speed: f64,
    previous_speed: f64,
    laps: u32,
    deslotted: bool,
}

impl SimulatedTrack {
    pub fn new(
        params: SimulationConfig,
        servo: &ServoConfig,
        encoder: SpaceEncoder,
        seed: Option<u64>,
    ) -> Result<SimulatedTrack> {
        if params.corners.is_empty() {
            return Err(SlotCarError::ConfigInvalid {
                field: "simulation.corners",
                reason: String::from("at least one corner is needed"),
            });
        }
        if servo.min_angle >= servo.max_angle {
            return Err(SlotCarError::ConfigInvalid {
                field: "servo.min_angle",
                reason: format!("must be below max_angle {}", servo.max_angle),
            });
        }
        let noise = if params.speed_noise > 0.0 {
            let uniform = Uniform::new(-params.speed_noise, params.speed_noise).map_err(|e| {
                SlotCarError::ConfigInvalid { field: "simulation.speed_noise", reason: e.to_string() }
            })?;
            Some(uniform)
        } else {
            None
        };
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let time_step = Duration::from_millis(params.time_step_ms).as_secs_f64();
        let distance = params.segment_length;
        Ok(SimulatedTrack {
            params,
            min_angle: servo.min_angle,
            max_angle: servo.max_angle,
            encoder,
            time_step,
            noise,
            rng,
            corner: 0,
            distance,
            speed: 0.0,
            previous_speed: 0.0,
            laps: 0,
            deslotted: false,
        })
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn next_corner(&self) -> FeatureKind {
        self.params.corners[self.corner]
    }

    pub fn distance_to_corner(&self) -> f64 {
        self.distance
    }

    pub fn laps_completed(&self) -> u32 {
        self.laps
    }

    pub fn is_deslotted(&self) -> bool {
        self.deslotted
    }

    /// Throttle maps linearly onto [0, top_speed], plus noise.
    fn speed_for(&mut self, angle: i32) -> f64 {
        let throttle = f64::from(angle - self.min_angle) / f64::from(self.max_angle - self.min_angle);
        let noise = match &self.noise {
            Some(uniform) => uniform.sample(&mut self.rng),
            None => 0.0,
        };
        throttle * self.params.top_speed + noise
    }

    fn advance(&mut self) {
        self.distance -= self.speed * self.params.distance_per_speed_unit * self.time_step;
        if self.distance > 0.0 {
            return;
        }
        self.distance = self.params.segment_length;
        if self.corner + 1 == self.params.corners.len() {
            self.corner = 0;
            self.laps += 1;
            debug!(laps = self.laps, "simulated lap completed");
        } else {
            self.corner += 1;
        }
    }

    fn check_deslot(&mut self) -> Result<()> {
        if self.next_corner() != FeatureKind::Turn {
            return Ok(());
        }
        let p = deslot_probability(self.speed, self.previous_speed);
        let bernoulli = Bernoulli::new(p).map_err(|e| SlotCarError::ConfigInvalid {
            field: "simulation",
            reason: e.to_string(),
        })?;
        let draw: f64 = bernoulli.sample(&mut self.rng);
        if draw == 1.0 {
            info!(speed = self.speed, previous_speed = self.previous_speed, laps = self.laps, "simulated deslot");
            self.deslotted = true;
            self.laps = 0;
        }
        Ok(())
    }
}

impl Track for SimulatedTrack {
    fn measure(&mut self) -> Result<Measurement> {
        let speed = if self.deslotted { 0.0 } else { self.speed };
        let state = self.encoder.clamp_state(self.next_corner().severity(), self.distance, speed);
        Ok(Measurement {
            state,
            speed,
            laps_completed: self.laps,
            deslotted: self.deslotted,
        })
    }

    fn apply(&mut self, action: Action) -> Result<()> {
        if action.0 < self.min_angle || action.0 > self.max_angle {
            return Err(SlotCarError::ActionInvalid(action.0));
        }
        // Off the track until reset.
        if self.deslotted {
            return Ok(());
        }
        self.previous_speed = self.speed;
        self.speed = self.speed_for(action.0);
        self.advance();
        self.check_deslot()
    }

    fn halt(&mut self) -> Result<()> {
        self.previous_speed = self.speed;
        self.speed = 0.0;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.deslotted = false;
        self.speed = 0.0;
        self.previous_speed = 0.0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{ActionShape, State, StateShape};
    use approx::assert_abs_diff_eq;
    use test_case::test_case;

    fn quiet(corners: Vec<FeatureKind>, time_step_ms: u64) -> SimulationConfig {
        SimulationConfig {
            speed_noise: 0.0,
            time_step_ms,
            corners,
            ..SimulationConfig::default()
        }
    }

    fn sim(params: SimulationConfig) -> SimulatedTrack {
        let encoder = SpaceEncoder::new(&StateShape::default(), &ActionShape::default()).unwrap();
        SimulatedTrack::new(params, &ServoConfig::default(), encoder, Some(7)).unwrap()
    }

    #[test_case(900.0, 900.0, 0.965; "Fast with momentum")]
    #[test_case(900.0, 100.0, 0.79; "Fast from slow")]
    #[test_case(900.0, 600.0, 0.65; "Fast")]
    #[test_case(700.0, 900.0, 0.68; "Medium after fast")]
    #[test_case(700.0, 600.0, 0.2; "Medium")]
    #[test_case(500.0, 500.0, 0.2; "Moderate")]
    #[test_case(500.0, 50.0, 0.0; "Moderate from standstill")]
    #[test_case(100.0, 900.0, 0.96; "Braking hard")]
    #[test_case(100.0, 0.0, 0.9; "Stalling")]
    fn deslot_probabilities(speed: f64, previous: f64, p: f64) {
        assert_abs_diff_eq!(deslot_probability(speed, previous), p, epsilon = 1e-12);
    }

    #[test]
    fn starts_stopped_before_first_corner() {
        let mut track = sim(SimulationConfig::default());
        let m = track.measure().unwrap();
        assert_eq!(m.state, State::new(0, 99, 0));
        assert_eq!(m.speed, 0.0);
        assert!(!m.deslotted);
    }

    #[test]
    fn throttle_sets_speed_and_moves_car() {
        // Arrange
        let mut track = sim(quiet(vec![FeatureKind::Straight], 500));
        // Act: 60 of 30..=90 is half throttle
        track.apply(Action(60)).unwrap();
        let m = track.measure().unwrap();
        // Assert: 495 * 0.1 * 0.5 s
        assert_abs_diff_eq!(track.speed(), 495.0, epsilon = 1e-9);
        assert_abs_diff_eq!(track.distance_to_corner(), 99.0 - 24.75, epsilon = 1e-9);
        assert_eq!(m.state, State::new(0, 74, 495));
    }

    #[test]
    fn passing_last_corner_completes_lap() {
        // Arrange
        let mut track = sim(quiet(vec![FeatureKind::Straight, FeatureKind::Straight], 2000));
        // Act
        for _ in 0..4 {
            track.apply(Action(90)).unwrap();
        }
        // Assert
        assert_eq!(track.laps_completed(), 2);
        assert_eq!(track.measure().unwrap().laps_completed, 2);
    }

    #[test]
    fn straights_never_deslot() {
        let mut track = sim(SimulationConfig {
            corners: vec![FeatureKind::Straight],
            ..SimulationConfig::default()
        });
        for _ in 0..200 {
            track.apply(Action(90)).unwrap();
        }
        assert!(!track.is_deslotted());
    }

    #[test]
    fn fast_turns_deslot_and_reset_recovers() {
        // Arrange
        let mut track = sim(quiet(vec![FeatureKind::Turn], 200));
        // Act
        let mut steps = 0;
        while !track.is_deslotted() && steps < 100 {
            track.apply(Action(90)).unwrap();
            steps += 1;
        }
        // Assert
        let m = track.measure().unwrap();
        assert!(m.deslotted);
        assert_eq!(m.speed, 0.0);
        assert_eq!(m.state.speed, 0);
        assert_eq!(m.laps_completed, 0);

        track.reset().unwrap();
        assert!(!track.measure().unwrap().deslotted);
    }

    #[test]
    fn rejects_angles_outside_servo_range() {
        let mut track = sim(SimulationConfig::default());
        assert!(matches!(track.apply(Action(91)), Err(SlotCarError::ActionInvalid(91))));
    }

    #[test]
    fn same_seed_same_run() {
        let mut a = sim(SimulationConfig::default());
        let mut b = sim(SimulationConfig::default());
        for angle in [40, 90, 70, 50, 88, 30] {
            a.apply(Action(angle)).unwrap();
            b.apply(Action(angle)).unwrap();
            assert_eq!(a.measure().unwrap(), b.measure().unwrap());
        }
    }
}
