mod annotate;
mod classify;
mod darknet;
mod motion;
mod object;
mod pipeline;
mod runner;

pub use annotate::{draw_blobs, draw_detections};
pub use classify::{classify, Bucket, ClassificationTally, ObjectClassifier};
pub use darknet::DarknetDetector;
pub use motion::{BackgroundMotionDetector, Blob, MotionOutput};
pub use object::{load_detector, DetectError, Detection, Detector, DetectorSettings, LabelTable, OnnxDetector};
pub use pipeline::{
    EffectMode, EffectState, FrameProcessingPipeline, PipelineError, PipelineStatus, ResultBundle, TickOutcome,
};
pub use runner::{spawn_pipeline, PipelineHandle};
