use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlotCarError};

/// Kind of track feature the car is heading toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    Straight,
    Turn,
}

impl FeatureKind {
    /// Value of the state's severity axis.
    pub fn severity(&self) -> i32 {
        match self {
            FeatureKind::Straight => 0,
            FeatureKind::Turn => 1,
        }
    }
}

/// Camera image coordinate (pixels).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Point {
        Point { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub location: Point,
    pub kind: FeatureKind,
}

/// A car position and the moment its frame was captured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub position: Point,
    pub time: Instant,
}

/// The feature the car is approaching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NextFeature {
    pub feature: Feature,
    /// Distance from the later position sample (mm)
    pub distance_mm: f64,
}

/// Everything the camera tells the controller from two successive samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CarObservation {
    pub position: Point,
    pub time: Instant,
    pub speed_mm_s: f64,
    pub next: NextFeature,
}

/// Known feature locations, fixed for a training session.
#[derive(Debug, Clone)]
pub struct TrackFeatures {
    features: Vec<Feature>,
    mm_per_pixel: f64,
}

impl TrackFeatures {
    /// At least `min_features` (and never fewer than 2) locations are required to tell
    /// which way the car is travelling.
    pub fn new(features: Vec<Feature>, mm_per_pixel: f64, min_features: usize) -> Result<TrackFeatures> {
        let required = min_features.max(2);
        if features.len() < required {
            return Err(SlotCarError::InsufficientFeatures {
                found: features.len(),
                required,
            });
        }
        if !(mm_per_pixel.is_finite() && mm_per_pixel > 0.0) {
            return Err(SlotCarError::ConfigInvalid {
                field: "camera.mm_per_pixel",
                reason: format!("must be a positive number, got {mm_per_pixel}"),
            });
        }
        Ok(TrackFeatures { features, mm_per_pixel })
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn pixels_to_mm(&self, pixels: f64) -> f64 {
        pixels * self.mm_per_pixel
    }

    /// Finds the feature the car is moving toward between `earlier` and `later`.
    ///
    /// The two features nearest to `earlier` are candidates (equal distances keep input
    /// order). The one whose distance shrank the most, or grew the least, wins. Equal
    /// deltas go to the second-nearest candidate.
    pub fn predict_next(&self, earlier: Option<Point>, later: Option<Point>) -> Result<NextFeature> {
        let p1 = earlier.ok_or_else(|| unavailable("earlier position"))?;
        let p2 = later.ok_or_else(|| unavailable("later position"))?;

        let mut by_distance: Vec<(f64, &Feature)> = self
            .features
            .iter()
            .map(|f| (p1.distance(&f.location), f))
            .collect();
        // Stable sort keeps input order among equal distances.
        by_distance.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (d1_before, f1) = by_distance[0];
        let (d2_before, f2) = by_distance[1];

        let d1_after = p2.distance(&f1.location);
        let d2_after = p2.distance(&f2.location);
        let (feature, pixels) = if d1_after - d1_before < d2_after - d2_before {
            (f1, d1_after)
        } else {
            (f2, d2_after)
        };

        Ok(NextFeature {
            feature: *feature,
            distance_mm: self.pixels_to_mm(pixels),
        })
    }

    /// Speed and next feature from two successive position samples.
    pub fn observe(
        &self,
        earlier: Option<PositionSample>,
        later: Option<PositionSample>,
    ) -> Result<CarObservation> {
        let s1 = earlier.ok_or_else(|| unavailable("earlier position"))?;
        let s2 = later.ok_or_else(|| unavailable("later position"))?;
        let elapsed = s2
            .time
            .checked_duration_since(s1.time)
            .map(|d| d.as_secs_f64())
            .filter(|&secs| secs > 0.0)
            .ok_or_else(|| unavailable("samples are not in time order"))?;

        let next = self.predict_next(Some(s1.position), Some(s2.position))?;
        let speed_mm_s = self.pixels_to_mm(s1.position.distance(&s2.position)) / elapsed;
        Ok(CarObservation {
            position: s2.position,
            time: s2.time,
            speed_mm_s,
            next,
        })
    }
}

fn unavailable(what: &str) -> SlotCarError {
    SlotCarError::MeasurementUnavailable(what.to_string())
}
