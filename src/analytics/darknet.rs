use std::path::Path;

use opencv::core::{Mat, Rect, Scalar, Size, Vector, CV_32F};
use opencv::dnn::{self, Net};
use opencv::prelude::*;

use super::object::{load_failed, suppress, Candidate, DetectError, Detection, Detector, DetectorSettings, LabelTable};

/// Columns before the per-class scores in a Darknet YOLO output row:
/// centre x, centre y, width, height, objectness.
const ROW_HEADER: usize = 5;

/// Darknet YOLO network loaded from a weights/config pair through OpenCV DNN.
pub struct DarknetDetector {
    net: Net,
    output_names: Vector<String>,
    labels: LabelTable,
    settings: DetectorSettings,
}

impl DarknetDetector {
    pub fn new(
        weights: &str,
        config: &Path,
        labels: LabelTable,
        settings: DetectorSettings,
    ) -> Result<Self, DetectError> {
        let cfg = config.to_string_lossy();
        let mut net = dnn::read_net_from_darknet(&cfg, weights).map_err(|e| load_failed(weights, e))?;
        if net.empty().map_err(|e| load_failed(weights, e))? {
            return Err(load_failed(weights, "network has no layers"));
        }
        net.set_preferable_backend(dnn::DNN_BACKEND_OPENCV)?;
        net.set_preferable_target(dnn::DNN_TARGET_CPU)?;
        let output_names = net.get_unconnected_out_layers_names()?;

        Ok(Self {
            net,
            output_names,
            labels,
            settings,
        })
    }
}

impl Detector for DarknetDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>, DetectError> {
        if frame.rows() == 0 || frame.cols() == 0 {
            return Ok(Vec::new());
        }

        let size = self.settings.input_size;
        let blob = dnn::blob_from_image(
            frame,
            1.0 / 255.0,
            Size::new(size, size),
            Scalar::default(),
            true,
            false,
            CV_32F,
        )?;
        self.net.set_input(&blob, "", 1.0, Scalar::default())?;

        let mut outputs = Vector::<Mat>::new();
        self.net.forward(&mut outputs, &self.output_names)?;

        let mut candidates = Vec::new();
        for output in outputs.iter() {
            candidates.extend(decode_rows(
                &output,
                frame.cols(),
                frame.rows(),
                self.settings.confidence,
            )?);
        }

        suppress(&candidates, &self.settings, &self.labels)
    }
}

/// Each row holds a normalized centre/size box, objectness, then one score
/// per class. The frame is stretched, not letterboxed, so normalized
/// coordinates scale straight to frame pixels.
fn decode_rows(
    output: &Mat,
    frame_w: i32,
    frame_h: i32,
    confidence: f32,
) -> Result<Vec<Candidate>, DetectError> {
    let mut candidates = Vec::new();
    if output.cols() as usize <= ROW_HEADER {
        return Ok(candidates);
    }

    let (fw, fh) = (frame_w as f32, frame_h as f32);
    for row in 0..output.rows() {
        let data = output.at_row::<f32>(row)?;
        let Some((class_id, &score)) = data[ROW_HEADER..]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            continue;
        };
        if score < confidence {
            continue;
        }

        let (w, h) = (data[2] * fw, data[3] * fh);
        let x = (data[0] * fw - w / 2.0).max(0.0);
        let y = (data[1] * fh - h / 2.0).max(0.0);
        candidates.push(Candidate {
            class_id,
            score,
            rect: Rect::new(x.round() as i32, y.round() as i32, w.round() as i32, h.round() as i32),
        });
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rows_scales_to_frame() {
        // two classes; second row is below the confidence floor
        let rows: [[f32; 7]; 2] = [
            [0.5, 0.5, 0.25, 0.5, 0.9, 0.1, 0.8],
            [0.2, 0.2, 0.1, 0.1, 0.9, 0.3, 0.2],
        ];
        let output = Mat::from_slice_2d(&rows).unwrap();

        let candidates = decode_rows(&output, 640, 480, 0.5).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class_id, 1);
        assert_eq!(candidates[0].rect, Rect::new(240, 120, 160, 240));
    }

    #[test]
    fn test_missing_weights_is_load_error() {
        let result = DarknetDetector::new(
            "/nonexistent/yolov4-tiny.weights",
            Path::new("/nonexistent/yolov4-tiny.cfg"),
            LabelTable::coco(),
            DetectorSettings {
                confidence: 0.5,
                nms: 0.4,
                input_size: 416,
            },
        );
        assert!(matches!(result, Err(DetectError::ModelLoad { .. })));
    }
}
