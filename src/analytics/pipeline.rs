use opencv::core::Mat;
use opencv::prelude::*;
use serde::Serialize;
use thiserror::Error;

use crate::config::{Config, StreamConfig};
use crate::source::{self, FrameSource, NextFrame, RawFrame, SourceError, SourceKind};

use super::annotate;
use super::classify::{ClassificationTally, ObjectClassifier};
use super::motion::{BackgroundMotionDetector, Blob};
use super::object::{load_detector, DetectError, Detection, LabelTable};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Detector(#[from] DetectError),
    #[error("no object detector loaded")]
    DetectorUnavailable,
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("source switch superseded by a later command")]
    Superseded,
    #[error("pipeline task is gone")]
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EffectState {
    pub background: bool,
    pub detection: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectMode {
    Off,
    BackgroundOnly,
    DetectionOnly,
    Both,
}

impl EffectState {
    pub fn any(&self) -> bool {
        self.background || self.detection
    }

    pub fn mode(&self) -> EffectMode {
        match (self.background, self.detection) {
            (false, false) => EffectMode::Off,
            (true, false) => EffectMode::BackgroundOnly,
            (false, true) => EffectMode::DetectionOnly,
            (true, true) => EffectMode::Both,
        }
    }
}

/// Everything one tick produced, handed to the renderer by value.
#[derive(Debug)]
pub struct ResultBundle {
    pub sequence: u64,
    pub raw_frame: RawFrame,
    pub mask: Option<Mat>,
    pub blobs: Option<Vec<Blob>>,
    /// Copy of the frame with motion boxes and/or detection labels drawn.
    pub annotated_frame: Option<Mat>,
    pub detections: Option<Vec<Detection>>,
    pub tally: Option<ClassificationTally>,
}

#[derive(Debug)]
pub enum TickOutcome {
    /// No source, or no frame ready yet.
    Idle,
    Frame(ResultBundle),
    /// The source ran dry; the pipeline has been stopped.
    Ended,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub effects: EffectState,
    pub source: Option<SourceKind>,
    pub tally: ClassificationTally,
    pub blobs: Vec<Blob>,
    pub frames_processed: u64,
}

pub struct FrameProcessingPipeline {
    motion: BackgroundMotionDetector,
    classifier: Option<ObjectClassifier>,
    source: Option<Box<dyn FrameSource>>,
    stream: StreamConfig,
    effects: EffectState,
    tally: ClassificationTally,
    blobs: Vec<Blob>,
    frames_processed: u64,
    /// Bumped whenever the current source is released; an open that started
    /// under an older value is stale.
    generation: u64,
}

impl FrameProcessingPipeline {
    pub fn new(
        motion: BackgroundMotionDetector,
        classifier: Option<ObjectClassifier>,
        stream: StreamConfig,
    ) -> Self {
        Self {
            motion,
            classifier,
            source: None,
            stream,
            effects: EffectState::default(),
            tally: ClassificationTally::default(),
            blobs: Vec::new(),
            frames_processed: 0,
            generation: 0,
        }
    }

    /// Build the pipeline and load the configured detector. A model that is
    /// configured but fails to load is an error here, not at first use.
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let motion = BackgroundMotionDetector::new(&config.motion)?;
        let labels = LabelTable::load(&config.detection)?;
        let classifier = load_detector(&config.detection, &labels)?
            .map(|detector| ObjectClassifier::new(detector, config.detection.adult_min_height));

        if classifier.is_none() {
            tracing::info!("no detection model configured, detection effect unavailable");
        }

        Ok(Self::new(motion, classifier, config.stream.clone()))
    }

    pub fn effects(&self) -> EffectState {
        self.effects
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.stream
    }

    pub fn has_detector(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            effects: self.effects,
            source: self.source.as_ref().map(|s| s.kind()),
            tally: self.tally,
            blobs: self.blobs.clone(),
            frames_processed: self.frames_processed,
        }
    }

    /// Open and switch to a new source. The current source is invalidated
    /// first; if the new one cannot be opened the pipeline is left stopped.
    pub async fn set_source(&mut self, kind: SourceKind, locator: &str) -> Result<(), PipelineError> {
        let generation = self.begin_switch();
        let opened = source::open(kind, locator, &self.stream).await;
        self.complete_switch(generation, opened)
    }

    /// Release the current source ahead of opening a new one elsewhere.
    /// Returns the token `complete_switch` must be given back.
    pub fn begin_switch(&mut self) -> u64 {
        self.release_source();
        self.blobs.clear();
        self.generation
    }

    /// Finish a switch started by `begin_switch`. An open that was overtaken
    /// by `stop`, another switch or `attach_source` is dropped, which cancels
    /// its producer.
    pub fn complete_switch(
        &mut self,
        generation: u64,
        opened: Result<Box<dyn FrameSource>, SourceError>,
    ) -> Result<(), PipelineError> {
        if generation != self.generation {
            tracing::debug!(generation, current = self.generation, "discarding stale source");
            return Err(PipelineError::Superseded);
        }
        match opened {
            Ok(source) => self.attach_source(source),
            Err(e) => {
                tracing::warn!(error = %e, "could not open source");
                self.stop();
                Err(e.into())
            }
        }
    }

    fn release_source(&mut self) {
        self.source = None;
        self.generation += 1;
    }

    /// Switch to an already-open source. The background model starts over.
    pub fn attach_source(&mut self, source: Box<dyn FrameSource>) -> Result<(), PipelineError> {
        self.release_source();
        self.motion.reset()?;
        self.blobs.clear();
        tracing::info!(kind = %source.kind(), source = %source.locator(), "source attached");
        self.source = Some(source);
        Ok(())
    }

    pub fn toggle_background(&mut self) -> EffectState {
        self.effects.background = !self.effects.background;
        if !self.effects.background {
            self.blobs.clear();
        }
        tracing::info!(background = self.effects.background, mode = ?self.effects.mode(), "background effect toggled");
        self.effects
    }

    pub fn toggle_detection(&mut self) -> Result<EffectState, PipelineError> {
        if !self.effects.detection && self.classifier.is_none() {
            return Err(PipelineError::DetectorUnavailable);
        }
        self.effects.detection = !self.effects.detection;
        if !self.effects.detection {
            self.tally = ClassificationTally::default();
        }
        tracing::info!(detection = self.effects.detection, mode = ?self.effects.mode(), "detection effect toggled");
        Ok(self.effects)
    }

    /// Release the source and return to OFF. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let was_running = self.source.is_some() || self.effects.any();
        self.release_source();
        self.effects = EffectState::default();
        self.tally = ClassificationTally::default();
        self.blobs.clear();
        if was_running {
            tracing::info!(frames = self.frames_processed, "pipeline stopped");
        }
    }

    /// Pull at most one frame and run the enabled effects on it.
    pub fn tick(&mut self) -> TickOutcome {
        let Some(source) = self.source.as_mut() else {
            return TickOutcome::Idle;
        };

        let frame = match source.next_frame() {
            NextFrame::Ready(frame) => frame,
            NextFrame::Pending => return TickOutcome::Idle,
            NextFrame::Ended => {
                tracing::info!(source = %source.locator(), "source exhausted");
                self.stop();
                return TickOutcome::Ended;
            }
        };

        if frame.is_empty() {
            tracing::trace!("skipping empty frame");
            return TickOutcome::Idle;
        }

        self.frames_processed += 1;
        TickOutcome::Frame(self.process(frame))
    }

    fn process(&mut self, frame: RawFrame) -> ResultBundle {
        let mut bundle = ResultBundle {
            sequence: self.frames_processed,
            raw_frame: frame,
            mask: None,
            blobs: None,
            annotated_frame: None,
            detections: None,
            tally: None,
        };

        if self.effects.background {
            match self.motion.process(bundle.raw_frame.image()) {
                Ok(output) => {
                    self.blobs.clone_from(&output.blobs);
                    bundle.mask = Some(output.mask);
                    bundle.blobs = Some(output.blobs);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "motion step failed, skipping frame");
                }
            }
        }

        if self.effects.detection {
            if let Some(classifier) = self.classifier.as_mut() {
                match classifier.detect(bundle.raw_frame.image()) {
                    Ok(detections) => {
                        let tally = classifier.classify(&detections);
                        self.tally = tally;
                        bundle.tally = Some(tally);
                        bundle.detections = Some(detections);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "detection failed, skipping frame");
                    }
                }
            }
        }

        if self.effects.any() {
            match annotated_copy(&bundle) {
                Ok(annotated) => bundle.annotated_frame = Some(annotated),
                Err(e) => tracing::debug!(error = %e, "could not draw overlay"),
            }
        }

        bundle
    }
}

fn annotated_copy(bundle: &ResultBundle) -> opencv::Result<Mat> {
    let mut annotated = bundle.raw_frame.image().try_clone()?;
    if let Some(blobs) = &bundle.blobs {
        annotate::draw_blobs(&mut annotated, blobs)?;
    }
    if let Some(detections) = &bundle.detections {
        annotate::draw_detections(&mut annotated, detections)?;
    }
    Ok(annotated)
}
