use std::path::Path;
use std::sync::Arc;

use ndarray::{Array4, ArrayViewD};
use opencv::core::{Mat, Rect, Size, Vector, BORDER_CONSTANT};
use opencv::dnn;
use opencv::imgproc;
use opencv::prelude::*;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use serde::Serialize;
use thiserror::Error;

use crate::config::DetectionConfig;

use super::darknet::DarknetDetector;

const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

const LETTERBOX_FILL: f64 = 114.0;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("failed to load model {path}: {reason}")]
    ModelLoad { path: String, reason: String },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("unsupported model output: {0}")]
    UnsupportedOutput(String),
    #[error("failed to read label file: {0}")]
    Labels(#[from] std::io::Error),
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
}

fn inference(e: impl std::fmt::Display) -> DetectError {
    DetectError::Inference(e.to_string())
}

pub(crate) fn load_failed(path: &str, e: impl std::fmt::Display) -> DetectError {
    DetectError::ModelLoad {
        path: path.to_string(),
        reason: e.to_string(),
    }
}

/// Class id to name mapping, built once and shared read-only.
#[derive(Debug, Clone)]
pub struct LabelTable {
    names: Arc<[String]>,
}

impl LabelTable {
    pub fn coco() -> Self {
        Self::from_names(COCO_CLASSES.iter().map(|s| s.to_string()))
    }

    pub fn from_names<I: IntoIterator<Item = String>>(names: I) -> Self {
        Self {
            names: names.into_iter().collect(),
        }
    }

    /// One class name per line; blank lines are skipped.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DetectError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_names(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        ))
    }

    pub fn load(config: &DetectionConfig) -> Result<Self, DetectError> {
        match &config.labels {
            Some(path) => Self::from_file(path),
            None => Ok(Self::coco()),
        }
    }

    pub fn name(&self, class_id: usize) -> String {
        self.names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub class_name: String,
    pub class_id: usize,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Detection {
    pub fn rect(&self) -> Rect {
        Rect::new(
            self.x.round() as i32,
            self.y.round() as i32,
            self.width.round() as i32,
            self.height.round() as i32,
        )
    }
}

/// A pretrained detector. Implementations return detections that already
/// passed the confidence floor and per-class NMS.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>, DetectError>;
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    pub confidence: f32,
    pub nms: f32,
    pub input_size: i32,
}

impl From<&DetectionConfig> for DetectorSettings {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            confidence: config.confidence,
            nms: config.nms,
            input_size: config.input_size,
        }
    }
}

/// Load the configured model, if any. `.onnx` models (or any model without a
/// Darknet cfg) go through ONNX Runtime, weights/cfg pairs through OpenCV DNN.
pub fn load_detector(
    config: &DetectionConfig,
    labels: &LabelTable,
) -> Result<Option<Box<dyn Detector>>, DetectError> {
    let Some(model) = config.model.as_deref() else {
        return Ok(None);
    };
    let settings = DetectorSettings::from(config);

    let detector: Box<dyn Detector> = match &config.model_config {
        Some(cfg) => Box::new(DarknetDetector::new(model, cfg, labels.clone(), settings)?),
        None => Box::new(OnnxDetector::new(model, labels.clone(), settings)?),
    };

    tracing::info!(model = %model, classes = labels.len(), "object detector loaded");
    Ok(Some(detector))
}

/// Box proposal in frame coordinates, before suppression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    pub class_id: usize,
    pub score: f32,
    pub rect: Rect,
}

/// Hand overlapping same-class proposals to OpenCV's batched NMS and turn
/// the survivors into labelled detections, best score first.
pub(crate) fn suppress(
    candidates: &[Candidate],
    settings: &DetectorSettings,
    labels: &LabelTable,
) -> Result<Vec<Detection>, DetectError> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let boxes: Vector<Rect> = candidates.iter().map(|c| c.rect).collect();
    let scores: Vector<f32> = candidates.iter().map(|c| c.score).collect();
    let class_ids: Vector<i32> = candidates.iter().map(|c| c.class_id as i32).collect();
    let mut keep = Vector::<i32>::new();

    dnn::nms_boxes_batched(
        &boxes,
        &scores,
        &class_ids,
        settings.confidence,
        settings.nms,
        &mut keep,
        1.0,
        0,
    )?;

    let mut detections: Vec<Detection> = keep
        .iter()
        .filter_map(|i| candidates.get(i as usize))
        .map(|c| Detection {
            class_name: labels.name(c.class_id),
            class_id: c.class_id,
            confidence: c.score,
            x: c.rect.x as f32,
            y: c.rect.y as f32,
            width: c.rect.width as f32,
            height: c.rect.height as f32,
        })
        .collect();
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    Ok(detections)
}

/// Scale and padding applied when fitting a frame into the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub frame_w: f32,
    pub frame_h: f32,
}

impl Letterbox {
    pub fn new(frame_w: i32, frame_h: i32, input_size: i32) -> Self {
        let (fw, fh, input) = (frame_w as f32, frame_h as f32, input_size as f32);
        let scale = (input / fw).min(input / fh);
        let new_w = (fw * scale).round() as i32;
        let new_h = (fh * scale).round() as i32;
        Self {
            scale,
            pad_x: ((input_size - new_w) / 2) as f32,
            pad_y: ((input_size - new_h) / 2) as f32,
            frame_w: fw,
            frame_h: fh,
        }
    }

    /// Map a centre/size box in model-input pixels back onto the frame,
    /// clamped to its bounds.
    pub fn to_frame(&self, cx: f32, cy: f32, w: f32, h: f32) -> Rect {
        let x = ((cx - w / 2.0) - self.pad_x) / self.scale;
        let y = ((cy - h / 2.0) - self.pad_y) / self.scale;
        let x = x.clamp(0.0, self.frame_w);
        let y = y.clamp(0.0, self.frame_h);
        let w = (w / self.scale).min(self.frame_w - x);
        let h = (h / self.scale).min(self.frame_h - y);
        Rect::new(x.round() as i32, y.round() as i32, w.round() as i32, h.round() as i32)
    }
}

pub struct OnnxDetector {
    session: Session,
    labels: LabelTable,
    settings: DetectorSettings,
}

impl OnnxDetector {
    pub fn new(model: &str, labels: LabelTable, settings: DetectorSettings) -> Result<Self, DetectError> {
        let builder = Session::builder()
            .map_err(|e| load_failed(model, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_failed(model, e))?
            .with_intra_threads(4)
            .map_err(|e| load_failed(model, e))?;

        let session = if model.starts_with("http://") || model.starts_with("https://") {
            builder.commit_from_url(model)
        } else {
            builder.commit_from_file(model)
        }
        .map_err(|e| load_failed(model, e))?;

        Ok(Self {
            session,
            labels,
            settings,
        })
    }

    fn preprocess(&self, frame: &Mat) -> Result<(Array4<f32>, Letterbox), DetectError> {
        let size = self.settings.input_size;
        let letterbox = Letterbox::new(frame.cols(), frame.rows(), size);
        let new_w = (letterbox.frame_w * letterbox.scale).round() as i32;
        let new_h = (letterbox.frame_h * letterbox.scale).round() as i32;

        let mut resized = Mat::default();
        imgproc::resize(
            frame,
            &mut resized,
            Size::new(new_w, new_h),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let pad_x = letterbox.pad_x as i32;
        let pad_y = letterbox.pad_y as i32;
        let mut padded = Mat::default();
        opencv::core::copy_make_border(
            &resized,
            &mut padded,
            pad_y,
            size - new_h - pad_y,
            pad_x,
            size - new_w - pad_x,
            BORDER_CONSTANT,
            opencv::core::Scalar::all(LETTERBOX_FILL),
        )?;

        let mut rgb = Mat::default();
        let code = if padded.channels() == 1 {
            imgproc::COLOR_GRAY2RGB
        } else {
            imgproc::COLOR_BGR2RGB
        };
        imgproc::cvt_color(&padded, &mut rgb, code, 0)?;

        let side = size as usize;
        let data = rgb.data_bytes()?;
        if data.len() < side * side * 3 {
            return Err(DetectError::Inference("frame data too small".into()));
        }

        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for y in 0..side {
            for x in 0..side {
                let idx = (y * side + x) * 3;
                tensor[[0, 0, y, x]] = data[idx] as f32 / 255.0;
                tensor[[0, 1, y, x]] = data[idx + 1] as f32 / 255.0;
                tensor[[0, 2, y, x]] = data[idx + 2] as f32 / 255.0;
            }
        }

        Ok((tensor, letterbox))
    }
}

impl Detector for OnnxDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>, DetectError> {
        if frame.rows() == 0 || frame.cols() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = self.preprocess(frame)?;
        let tensor = TensorRef::from_array_view(input.view()).map_err(inference)?.into_dyn();
        let outputs = self.session.run(ort::inputs![tensor]).map_err(inference)?;

        let input_size = self.settings.input_size as f32;
        let candidates = if let (Some(logits), Some(boxes)) =
            (outputs.get("logits"), outputs.get("pred_boxes"))
        {
            let logits = logits.try_extract_array::<f32>().map_err(inference)?;
            let boxes = boxes.try_extract_array::<f32>().map_err(inference)?;
            decode_end_to_end(&logits, &boxes, input_size, &letterbox, self.settings.confidence)?
        } else if let Some(output) = outputs.get("output0") {
            let output = output.try_extract_array::<f32>().map_err(inference)?;
            decode_yolov8(&output, &letterbox, self.settings.confidence)?
        } else {
            return Err(DetectError::UnsupportedOutput(
                "expected 'output0' or 'logits' + 'pred_boxes'".into(),
            ));
        };
        drop(outputs);

        suppress(&candidates, &self.settings, &self.labels)
    }
}

/// YOLOv8-style head: `[1, 4 + classes, anchors]`, boxes as centre/size in
/// model-input pixels, scores already activated.
pub(crate) fn decode_yolov8(
    output: &ArrayViewD<f32>,
    letterbox: &Letterbox,
    confidence: f32,
) -> Result<Vec<Candidate>, DetectError> {
    let shape = output.shape();
    if shape.len() != 3 || shape[1] <= 4 {
        return Err(DetectError::UnsupportedOutput(format!("output0 shape {shape:?}")));
    }
    let (rows, anchors) = (shape[1], shape[2]);

    let mut candidates = Vec::new();
    for a in 0..anchors {
        let mut best = (0usize, 0.0f32);
        for c in 4..rows {
            let score = output[[0, c, a]];
            if score > best.1 {
                best = (c - 4, score);
            }
        }
        if best.1 < confidence {
            continue;
        }

        let rect = letterbox.to_frame(
            output[[0, 0, a]],
            output[[0, 1, a]],
            output[[0, 2, a]],
            output[[0, 3, a]],
        );
        candidates.push(Candidate {
            class_id: best.0,
            score: best.1,
            rect,
        });
    }
    Ok(candidates)
}

/// End-to-end head: `logits [1, queries, classes]` and normalized centre/size
/// `pred_boxes [1, queries, 4]`.
pub(crate) fn decode_end_to_end(
    logits: &ArrayViewD<f32>,
    boxes: &ArrayViewD<f32>,
    input_size: f32,
    letterbox: &Letterbox,
    confidence: f32,
) -> Result<Vec<Candidate>, DetectError> {
    let logits_shape = logits.shape();
    if logits_shape.len() != 3 || boxes.shape().len() != 3 {
        return Err(DetectError::UnsupportedOutput(format!(
            "logits {:?}, pred_boxes {:?}",
            logits_shape,
            boxes.shape()
        )));
    }
    let (queries, classes) = (logits_shape[1], logits_shape[2]);
    let boxes_shape = boxes.shape();
    if boxes_shape[1] < queries || boxes_shape[2] < 4 {
        return Err(DetectError::UnsupportedOutput(format!(
            "pred_boxes {boxes_shape:?} does not cover logits {logits_shape:?}"
        )));
    }

    let mut candidates = Vec::new();
    for q in 0..queries {
        let mut best = (0usize, 0.0f32);
        for c in 0..classes {
            let score = 1.0 / (1.0 + (-logits[[0, q, c]]).exp());
            if score > best.1 {
                best = (c, score);
            }
        }
        if best.1 < confidence {
            continue;
        }

        let rect = letterbox.to_frame(
            boxes[[0, q, 0]] * input_size,
            boxes[[0, q, 1]] * input_size,
            boxes[[0, q, 2]] * input_size,
            boxes[[0, q, 3]] * input_size,
        );
        candidates.push(Candidate {
            class_id: best.0,
            score: best.1,
            rect,
        });
    }
    Ok(candidates)
}
