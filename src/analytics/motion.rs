use opencv::{
    core::{Mat, Point, Ptr, Rect, Size, Vector, BORDER_CONSTANT},
    imgproc,
    prelude::*,
    video::{self, BackgroundSubtractorMOG2, BackgroundSubtractorTrait},
    Result as CvResult,
};
use serde::Serialize;

use crate::config::MotionConfig;

/// MOG2 marks confident foreground 255 and shadows 127; anything under this
/// is treated as background.
const FOREGROUND_CUTOFF: f64 = 200.0;

/// A connected foreground region of a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Blob {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub area: f64,
}

impl Blob {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

pub struct MotionOutput {
    /// Denoised binary mask, 255 for foreground and 0 for background.
    pub mask: Mat,
    pub blobs: Vec<Blob>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameShape {
    width: i32,
    height: i32,
    typ: i32,
}

impl FrameShape {
    fn of(frame: &Mat) -> Self {
        Self {
            width: frame.cols(),
            height: frame.rows(),
            typ: frame.typ(),
        }
    }
}

pub struct BackgroundMotionDetector {
    mog2: Ptr<BackgroundSubtractorMOG2>,
    kernel: Mat,
    config: MotionConfig,
    shape: Option<FrameShape>,
    resets: u64,
}

impl BackgroundMotionDetector {
    pub fn new(config: &MotionConfig) -> CvResult<Self> {
        let mog2 = create_model(config)?;
        let kernel = imgproc::get_structuring_element(
            imgproc::MORPH_ELLIPSE,
            Size::new(config.kernel_size, config.kernel_size),
            Point::new(-1, -1),
        )?;

        Ok(Self {
            mog2,
            kernel,
            config: config.clone(),
            shape: None,
            resets: 0,
        })
    }

    /// Drop everything learned so far. The next frame starts a fresh model.
    pub fn reset(&mut self) -> CvResult<()> {
        self.mog2 = create_model(&self.config)?;
        self.shape = None;
        self.resets += 1;
        Ok(())
    }

    /// Number of times the model was rebuilt, explicitly or after a change of
    /// frame geometry.
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Feed one frame to the background model and return the denoised
    /// foreground mask.
    pub fn apply(&mut self, frame: &Mat) -> CvResult<Mat> {
        let shape = FrameShape::of(frame);
        if let Some(previous) = self.shape {
            if previous != shape {
                tracing::debug!(
                    old_width = previous.width,
                    old_height = previous.height,
                    width = shape.width,
                    height = shape.height,
                    "frame geometry changed, reinitializing background model"
                );
                self.reset()?;
            }
        }
        self.shape = Some(shape);

        let mut raw = Mat::default();
        BackgroundSubtractorTrait::apply(&mut self.mog2, frame, &mut raw, self.config.learning_rate)?;

        let mut binary = Mat::default();
        imgproc::threshold(&raw, &mut binary, FOREGROUND_CUTOFF, 255.0, imgproc::THRESH_BINARY)?;

        denoise(&binary, &self.kernel)
    }

    /// `apply` followed by blob extraction with the configured area floor.
    pub fn process(&mut self, frame: &Mat) -> CvResult<MotionOutput> {
        let mask = self.apply(frame)?;
        let blobs = extract_blobs(&mask, self.config.min_blob_area)?;
        Ok(MotionOutput { mask, blobs })
    }
}

fn create_model(config: &MotionConfig) -> CvResult<Ptr<BackgroundSubtractorMOG2>> {
    video::create_background_subtractor_mog2(
        config.history,
        config.var_threshold,
        config.detect_shadows,
    )
}

/// Closing fills pinholes inside moving regions, opening then removes specks.
pub fn denoise(mask: &Mat, kernel: &Mat) -> CvResult<Mat> {
    let border = imgproc::morphology_default_border_value()?;

    let mut closed = Mat::default();
    imgproc::morphology_ex(
        mask,
        &mut closed,
        imgproc::MORPH_CLOSE,
        kernel,
        Point::new(-1, -1),
        1,
        BORDER_CONSTANT,
        border,
    )?;

    let mut opened = Mat::default();
    imgproc::morphology_ex(
        &closed,
        &mut opened,
        imgproc::MORPH_OPEN,
        kernel,
        Point::new(-1, -1),
        1,
        BORDER_CONSTANT,
        border,
    )?;

    Ok(opened)
}

/// Outer contours of `mask` whose area exceeds `min_area`.
pub fn extract_blobs(mask: &Mat, min_area: f64) -> CvResult<Vec<Blob>> {
    let mut contours: Vector<Vector<Point>> = Vector::new();
    let mut scratch = mask.try_clone()?;
    imgproc::find_contours(
        &mut scratch,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_SIMPLE,
        Point::new(0, 0),
    )?;

    let mut blobs = Vec::new();
    for contour in contours.iter() {
        let area = imgproc::contour_area(&contour, false)?;
        if area <= min_area {
            continue;
        }
        let rect = imgproc::bounding_rect(&contour)?;
        blobs.push(Blob {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            area,
        });
    }

    Ok(blobs)
}

/// Solid-colour frame helper shared by tests across the analytics module.
#[cfg(test)]
pub(crate) fn solid_frame(width: i32, height: i32, value: f64) -> Mat {
    Mat::new_rows_cols_with_default(
        height,
        width,
        opencv::core::CV_8UC3,
        opencv::core::Scalar::all(value),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC1};

    fn empty_mask(width: i32, height: i32) -> Mat {
        Mat::new_rows_cols_with_default(height, width, CV_8UC1, Scalar::all(0.0)).unwrap()
    }

    fn fill(mask: &mut Mat, rect: Rect) {
        imgproc::rectangle(mask, rect, Scalar::all(255.0), imgproc::FILLED, imgproc::LINE_8, 0).unwrap();
    }

    fn kernel() -> Mat {
        imgproc::get_structuring_element(imgproc::MORPH_ELLIPSE, Size::new(5, 5), Point::new(-1, -1))
            .unwrap()
    }

    #[test]
    fn test_mask_matches_frame_size() {
        let mut detector = BackgroundMotionDetector::new(&MotionConfig::default()).unwrap();
        let mask = detector.apply(&solid_frame(320, 240, 60.0)).unwrap();
        assert_eq!((mask.cols(), mask.rows()), (320, 240));
        assert_eq!(mask.channels(), 1);
    }

    #[test]
    fn test_geometry_change_reinitializes() {
        let mut detector = BackgroundMotionDetector::new(&MotionConfig::default()).unwrap();
        detector.apply(&solid_frame(320, 240, 60.0)).unwrap();
        detector.apply(&solid_frame(320, 240, 60.0)).unwrap();
        assert_eq!(detector.resets(), 0);

        let mask = detector.apply(&solid_frame(160, 120, 60.0)).unwrap();
        assert_eq!((mask.cols(), mask.rows()), (160, 120));
        assert_eq!(detector.resets(), 1);
    }

    #[test]
    fn test_denoise_removes_specks_and_fills_holes() {
        let mut mask = empty_mask(100, 100);
        fill(&mut mask, Rect::new(20, 20, 40, 40));
        // pinhole inside the region
        *mask.at_2d_mut::<u8>(40, 40).unwrap() = 0;
        // isolated speck far away
        *mask.at_2d_mut::<u8>(90, 90).unwrap() = 255;

        let clean = denoise(&mask, &kernel()).unwrap();
        assert_eq!(*clean.at_2d::<u8>(40, 40).unwrap(), 255);
        assert_eq!(*clean.at_2d::<u8>(90, 90).unwrap(), 0);
    }

    #[test]
    fn test_small_regions_are_not_blobs() {
        let mut mask = empty_mask(200, 200);
        fill(&mut mask, Rect::new(10, 10, 60, 60));
        fill(&mut mask, Rect::new(120, 120, 15, 15));

        let blobs = extract_blobs(&mask, 500.0).unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].rect(), Rect::new(10, 10, 60, 60));
        assert!(blobs.iter().all(|b| b.area > 500.0));
    }

    #[test]
    fn test_empty_mask_has_no_blobs() {
        let blobs = extract_blobs(&empty_mask(64, 64), 500.0).unwrap();
        assert!(blobs.is_empty());
    }

    #[test]
    fn test_moving_square_becomes_blob() {
        let mut detector = BackgroundMotionDetector::new(&MotionConfig::default()).unwrap();
        for _ in 0..30 {
            detector.process(&solid_frame(320, 240, 50.0)).unwrap();
        }

        let mut frame = solid_frame(320, 240, 50.0);
        imgproc::rectangle(
            &mut frame,
            Rect::new(100, 80, 60, 60),
            Scalar::all(250.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let output = detector.process(&frame).unwrap();
        assert_eq!(output.blobs.len(), 1);
        let blob = output.blobs[0];
        assert!((blob.x - 100).abs() <= 3 && (blob.y - 80).abs() <= 3);
        assert!(blob.area > 500.0);
    }
}
