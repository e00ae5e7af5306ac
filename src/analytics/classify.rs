//! Adult/child/animal counting over one frame's detections.
//!
//! Box height stands in for subject height. That only holds while the
//! camera's framing and distance to the subjects stay roughly constant, so
//! the counts are a rough signal and not a measurement. Nothing is smoothed
//! or tracked between frames.

use opencv::core::Mat;
use serde::Serialize;

use super::object::{DetectError, Detection, Detector};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationTally {
    pub adults: u32,
    pub children: u32,
    pub animals: u32,
}

impl ClassificationTally {
    pub fn total(&self) -> u32 {
        self.adults + self.children + self.animals
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Adult,
    Child,
    Animal,
}

/// Which bucket a detection falls in, if any. A person taller than
/// `adult_min_height` pixels is an adult.
pub fn bucket(detection: &Detection, adult_min_height: f32) -> Option<Bucket> {
    match detection.class_name.as_str() {
        "person" if detection.height > adult_min_height => Some(Bucket::Adult),
        "person" => Some(Bucket::Child),
        "cat" | "dog" => Some(Bucket::Animal),
        _ => None,
    }
}

pub fn classify(detections: &[Detection], adult_min_height: f32) -> ClassificationTally {
    let mut tally = ClassificationTally::default();
    for detection in detections {
        match bucket(detection, adult_min_height) {
            Some(Bucket::Adult) => tally.adults += 1,
            Some(Bucket::Child) => tally.children += 1,
            Some(Bucket::Animal) => tally.animals += 1,
            None => {}
        }
    }
    tally
}

/// A loaded detector paired with the height heuristic.
pub struct ObjectClassifier {
    detector: Box<dyn Detector>,
    adult_min_height: f32,
}

impl ObjectClassifier {
    pub fn new(detector: Box<dyn Detector>, adult_min_height: f32) -> Self {
        Self {
            detector,
            adult_min_height,
        }
    }

    pub fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>, DetectError> {
        self.detector.detect(frame)
    }

    pub fn classify(&self, detections: &[Detection]) -> ClassificationTally {
        classify(detections, self.adult_min_height)
    }
}
