use std::io::Write;

use tracing::debug;

use crate::config::ServoConfig;
use crate::error::{Result, SlotCarError};
use crate::space::Action;

/// Applies throttle commands to the car.
pub trait Actuator {
    fn apply(&mut self, action: Action) -> Result<()>;
    /// Bring the car to a halt.
    fn stop(&mut self) -> Result<()>;
}

/// Throttle servo driven over a serial link: each angle is sent as a single byte.
pub struct SerialServo<W: Write> {
    port: W,
    min_angle: i32,
    max_angle: i32,
    last_angle: Option<i32>,
}

impl<W: Write> SerialServo<W> {
    pub fn new(port: W, config: &ServoConfig) -> Result<SerialServo<W>> {
        if config.min_angle < 0 || config.max_angle > i32::from(u8::MAX) || config.min_angle >= config.max_angle {
            return Err(SlotCarError::ConfigInvalid {
                field: "servo",
                reason: format!(
                    "angle range {}..={} must be increasing and fit in one byte",
                    config.min_angle, config.max_angle
                ),
            });
        }
        Ok(SerialServo {
            port,
            min_angle: config.min_angle,
            max_angle: config.max_angle,
            last_angle: None,
        })
    }

    pub fn angle_is_valid(&self, angle: i32) -> bool {
        self.min_angle <= angle && angle <= self.max_angle
    }

    pub fn into_inner(self) -> W {
        self.port
    }
}

impl<W: Write> Actuator for SerialServo<W> {
    fn apply(&mut self, action: Action) -> Result<()> {
        let angle = action.0;
        if !self.angle_is_valid(angle) {
            return Err(SlotCarError::ActionInvalid(angle));
        }
        // The servo holds its position, so repeats are not resent.
        if self.last_angle == Some(angle) {
            return Ok(());
        }
        self.port
            .write_all(&[angle as u8])
            .and_then(|_| self.port.flush())
            .map_err(|e| SlotCarError::Actuator(e.to_string()))?;
        debug!(angle, "servo angle set");
        self.last_angle = Some(angle);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.apply(Action(self.min_angle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servo() -> SerialServo<Vec<u8>> {
        SerialServo::new(Vec::new(), &ServoConfig::default()).unwrap()
    }

    #[test]
    fn writes_one_byte_per_new_angle() {
        // Arrange
        let mut servo = servo();
        // Act
        servo.apply(Action(62)).unwrap();
        servo.apply(Action(62)).unwrap();
        servo.apply(Action(90)).unwrap();
        servo.stop().unwrap();
        // Assert
        assert_eq!(servo.into_inner(), vec![62, 90, 30]);
    }

    #[test]
    fn rejects_angles_outside_range() {
        let mut servo = servo();
        assert!(matches!(servo.apply(Action(91)), Err(SlotCarError::ActionInvalid(91))));
        assert!(matches!(servo.apply(Action(29)), Err(SlotCarError::ActionInvalid(29))));
        assert!(servo.into_inner().is_empty());
    }

    #[test]
    fn rejects_range_wider_than_a_byte() {
        let config = ServoConfig { min_angle: 0, max_angle: 300 };
        assert!(SerialServo::new(Vec::<u8>::new(), &config).is_err());
    }

    struct BrokenPort;

    impl Write for BrokenPort {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn port_failure_is_an_actuator_error() {
        let mut servo = SerialServo::new(BrokenPort, &ServoConfig::default()).unwrap();
        assert!(matches!(servo.apply(Action(40)), Err(SlotCarError::Actuator(_))));
    }
}
