use std::collections::HashMap;
use std::io::BufRead;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::HallConfig;
use crate::error::{Result, SlotCarError};
use crate::track::{Point, PositionSample};

/// One hall sensor activation: the car passed both magnets of `sensor`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HallEvent {
    pub sensor: u8,
    pub speed_mm_s: f64,
    pub time: Instant,
}

/// Most recent hall speed measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HallReading {
    pub speed_mm_s: f64,
    pub time: Instant,
}

/// Parses a `"<sensor> <millis>"` line sent by the track microcontroller.
///
/// `millis` is the time the car took to travel between the sensor's two magnets.
pub fn parse_hall_line(line: &str, magnet_distance_mm: f64, time: Instant) -> Option<HallEvent> {
    let mut parts = line.split_whitespace();
    let sensor = parts.next()?.parse().ok()?;
    let millis: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || millis < 0.0 {
        return None;
    }
    let speed_mm_s = if millis == 0.0 {
        0.0
    } else {
        magnet_distance_mm / (millis / 1000.0)
    };
    Some(HallEvent { sensor, speed_mm_s, time })
}

/// Reads hall lines on a dedicated thread and forwards parsed events.
///
/// The thread ends when the reader is exhausted, fails, or the receiver is dropped.
pub fn spawn_hall_reader<R>(
    reader: R,
    magnet_distance_mm: f64,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<HallEvent>)
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = thread::spawn(move || {
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "hall sensor input failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_hall_line(&line, magnet_distance_mm, Instant::now()) {
                Some(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                None => debug!(line = %line, "ignoring malformed hall line"),
            }
        }
        info!("hall sensor reader stopped");
    });
    (handle, rx)
}

/// Source of hall sensor data used by the control loop.
pub trait HallSensor {
    fn latest(&mut self) -> Option<HallReading>;
    /// Laps completed since the last reset.
    fn laps_completed(&mut self) -> u32;
    fn reset_laps(&mut self);
}

/// Single consumer of hall events: keeps the latest speed and counts laps.
///
/// A lap is counted when the start/finish sensor fires and every sensor has fired
/// at least once since the last reset.
#[derive(Debug)]
pub struct HallMonitor {
    events: mpsc::UnboundedReceiver<HallEvent>,
    num_sensors: usize,
    start_finish_sensor: u8,
    activations: HashMap<u8, Instant>,
    latest: Option<HallReading>,
    laps: u32,
    lap_times: Vec<Duration>,
}

impl HallMonitor {
    pub fn new(events: mpsc::UnboundedReceiver<HallEvent>, config: &HallConfig) -> HallMonitor {
        HallMonitor {
            events,
            num_sensors: config.num_sensors,
            start_finish_sensor: config.start_finish_sensor,
            activations: HashMap::new(),
            latest: None,
            laps: 0,
            lap_times: Vec::new(),
        }
    }

    fn poll(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.record(event);
        }
    }

    fn record(&mut self, event: HallEvent) {
        self.latest = Some(HallReading {
            speed_mm_s: event.speed_mm_s,
            time: event.time,
        });
        if event.sensor == self.start_finish_sensor && self.activations.len() >= self.num_sensors {
            if let Some(previous) = self.activations.get(&event.sensor) {
                let lap_time = event.time.saturating_duration_since(*previous);
                self.laps += 1;
                self.lap_times.push(lap_time);
                info!(lap = self.laps, seconds = lap_time.as_secs_f64(), "lap completed");
            }
        }
        self.activations.insert(event.sensor, event.time);
    }

    /// Sensors that fired since the last reset.
    pub fn sensors_activated(&mut self) -> usize {
        self.poll();
        self.activations.len()
    }

    pub fn lap_times(&mut self) -> &[Duration] {
        self.poll();
        &self.lap_times
    }
}

impl HallSensor for HallMonitor {
    fn latest(&mut self) -> Option<HallReading> {
        self.poll();
        self.latest
    }

    fn laps_completed(&mut self) -> u32 {
        self.poll();
        self.laps
    }

    fn reset_laps(&mut self) {
        self.poll();
        self.activations.clear();
        self.laps = 0;
    }
}

/// Compares the camera speed with a hall reading taken close enough in time.
///
/// Returns the mean of both speeds when they agree, the camera speed alone when no
/// recent hall reading exists, and `SpeedMismatch` otherwise.
pub fn cross_validate_speed(
    camera_mm_s: f64,
    camera_time: Instant,
    hall: Option<HallReading>,
    config: &HallConfig,
) -> Result<f64> {
    let max_gap = Duration::from_millis(config.max_time_between_ms);
    let recent = hall.filter(|reading| {
        let gap = if reading.time > camera_time {
            reading.time - camera_time
        } else {
            camera_time - reading.time
        };
        gap <= max_gap
    });
    let Some(reading) = recent else {
        return Ok(camera_mm_s);
    };
    if (camera_mm_s - reading.speed_mm_s).abs() > config.speed_tolerance_mm_s {
        return Err(SlotCarError::SpeedMismatch {
            camera_mm_s,
            hall_mm_s: reading.speed_mm_s,
            tolerance_mm_s: config.speed_tolerance_mm_s,
        });
    }
    Ok((camera_mm_s + reading.speed_mm_s) / 2.0)
}

/// Blocking frame source that locates the car in each frame.
pub trait CameraFeed {
    /// `Ok(None)` when the frame was read but the car is not visible.
    fn read_position(&mut self) -> Result<Option<Point>>;
}

/// The two most recent frames: (earlier, later). `None` marks a frame without a car.
pub type PositionPair = (Option<PositionSample>, Option<PositionSample>);

/// Runs `camera` on its own thread, publishing every new pair of successive samples.
///
/// The control thread only ever sees immutable copies through the watch channel. The
/// thread ends when the camera fails or every receiver is dropped.
pub fn spawn_position_sampler<C>(mut camera: C) -> (JoinHandle<Result<()>>, watch::Receiver<PositionPair>)
where
    C: CameraFeed + Send + 'static,
{
    let (tx, rx) = watch::channel((None, None));
    let handle = thread::spawn(move || {
        let mut previous: Option<PositionSample> = None;
        loop {
            let current = camera.read_position().map_err(|e| {
                warn!(error = %e, "camera sampling stopped");
                e
            })?;
            let current = current.map(|position| PositionSample {
                position,
                time: Instant::now(),
            });
            if tx.send((previous, current)).is_err() {
                return Ok(());
            }
            previous = current;
        }
    });
    (handle, rx)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use approx::assert_abs_diff_eq;
    use test_case::test_case;

    fn event(sensor: u8, time: Instant) -> HallEvent {
        HallEvent { sensor, speed_mm_s: 500.0, time }
    }

    #[test_case("1 88", 1, 1000.0; "One metre per second")]
    #[test_case("2 176.0", 2, 500.0; "Float millis")]
    #[test_case("2 0", 2, 0.0; "Zero millis")]
    fn parse_valid_lines(line: &str, sensor: u8, speed: f64) {
        let parsed = parse_hall_line(line, 88.0, Instant::now()).unwrap();
        assert_eq!(parsed.sensor, sensor);
        assert_abs_diff_eq!(parsed.speed_mm_s, speed, epsilon = 1e-9);
    }

    #[test_case(""; "Empty")]
    #[test_case("1"; "Missing millis")]
    #[test_case("x 10"; "Bad sensor")]
    #[test_case("1 10 3"; "Extra field")]
    #[test_case("1 -5"; "Negative millis")]
    fn parse_invalid_lines(line: &str) {
        assert!(parse_hall_line(line, 88.0, Instant::now()).is_none());
    }

    #[test]
    fn reader_thread_forwards_events() {
        // Arrange
        let input = Cursor::new("1 88\ngarbage\n\n2 44\n");
        // Act
        let (handle, mut rx) = spawn_hall_reader(input, 88.0);
        handle.join().unwrap();
        // Assert
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.sensor, 1);
        assert_abs_diff_eq!(second.speed_mm_s, 2000.0, epsilon = 1e-9);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn laps_need_every_sensor() {
        // Arrange
        let (tx, rx) = mpsc::unbounded_channel();
        let mut monitor = HallMonitor::new(rx, &HallConfig::default());
        let t0 = Instant::now();
        // Act: start/finish first, then sensor 1, then start/finish again
        tx.send(event(2, t0)).unwrap();
        assert_eq!(monitor.laps_completed(), 0);
        tx.send(event(1, t0 + Duration::from_secs(2))).unwrap();
        tx.send(event(2, t0 + Duration::from_secs(5))).unwrap();
        // Assert
        assert_eq!(monitor.laps_completed(), 1);
        assert_eq!(monitor.lap_times(), &[Duration::from_secs(5)]);
        assert_eq!(monitor.sensors_activated(), 2);
    }

    #[test]
    fn reset_clears_laps_and_activations() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut monitor = HallMonitor::new(rx, &HallConfig::default());
        let t0 = Instant::now();
        for (i, sensor) in [2, 1, 2].into_iter().enumerate() {
            tx.send(event(sensor, t0 + Duration::from_secs(i as u64))).unwrap();
        }
        assert_eq!(monitor.laps_completed(), 1);
        monitor.reset_laps();
        tx.send(event(2, t0 + Duration::from_secs(10))).unwrap();
        assert_eq!(monitor.laps_completed(), 0);
        assert_eq!(monitor.sensors_activated(), 1);
        assert!(monitor.latest().is_some());
    }

    #[test]
    fn speeds_within_tolerance_are_averaged() {
        let now = Instant::now();
        let hall = HallReading { speed_mm_s: 900.0, time: now + Duration::from_millis(20) };
        let speed = cross_validate_speed(1000.0, now, Some(hall), &HallConfig::default()).unwrap();
        assert_abs_diff_eq!(speed, 950.0);
    }

    #[test]
    fn speeds_outside_tolerance_are_rejected() {
        let now = Instant::now();
        let hall = HallReading { speed_mm_s: 700.0, time: now };
        let err = cross_validate_speed(1000.0, now, Some(hall), &HallConfig::default()).unwrap_err();
        assert!(matches!(err, SlotCarError::SpeedMismatch { .. }));
        assert!(err.is_recoverable());
    }

    #[test_case(None; "No hall reading")]
    #[test_case(Some(Duration::from_millis(51)); "Stale hall reading")]
    fn camera_speed_used_without_recent_hall(age: Option<Duration>) {
        let start = Instant::now();
        let camera_time = start + Duration::from_secs(1);
        let hall = age.map(|a| HallReading { speed_mm_s: 10.0, time: camera_time - a });
        let speed = cross_validate_speed(1000.0, camera_time, hall, &HallConfig::default()).unwrap();
        assert_abs_diff_eq!(speed, 1000.0);
    }

    struct ScriptedCamera {
        frames: Vec<Option<Point>>,
    }

    impl CameraFeed for ScriptedCamera {
        fn read_position(&mut self) -> Result<Option<Point>> {
            if self.frames.is_empty() {
                return Err(SlotCarError::MeasurementUnavailable("camera closed".into()));
            }
            Ok(self.frames.remove(0))
        }
    }

    #[test]
    fn sampler_publishes_successive_pairs() {
        // Arrange
        let camera = ScriptedCamera {
            frames: vec![Some(Point::new(1.0, 1.0)), None, Some(Point::new(3.0, 3.0))],
        };
        // Act
        let (handle, rx) = spawn_position_sampler(camera);
        let outcome = handle.join().unwrap();
        // Assert
        assert!(outcome.is_err());
        let (earlier, later) = *rx.borrow();
        assert!(earlier.is_none());
        assert_eq!(later.unwrap().position, Point::new(3.0, 3.0));
    }
}
