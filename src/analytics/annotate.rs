use opencv::core::{Mat, Point, Scalar};
use opencv::imgproc;
use opencv::Result as CvResult;

use super::motion::Blob;
use super::object::Detection;

const MOTION_COLOR: (f64, f64, f64) = (0.0, 255.0, 0.0);

const PALETTE: [(f64, f64, f64); 6] = [
    (255.0, 128.0, 0.0),
    (0.0, 128.0, 255.0),
    (255.0, 0.0, 255.0),
    (0.0, 255.0, 255.0),
    (128.0, 0.0, 255.0),
    (255.0, 255.0, 0.0),
];

fn bgr((b, g, r): (f64, f64, f64)) -> Scalar {
    Scalar::new(b, g, r, 0.0)
}

pub fn class_color(class_id: usize) -> Scalar {
    bgr(PALETTE[class_id % PALETTE.len()])
}

pub fn draw_blobs(frame: &mut Mat, blobs: &[Blob]) -> CvResult<()> {
    let color = bgr(MOTION_COLOR);
    for blob in blobs {
        imgproc::rectangle(frame, blob.rect(), color, 2, imgproc::LINE_8, 0)?;
    }
    Ok(())
}

pub fn draw_detections(frame: &mut Mat, detections: &[Detection]) -> CvResult<()> {
    for detection in detections {
        let color = class_color(detection.class_id);
        let rect = detection.rect();
        imgproc::rectangle(frame, rect, color, 2, imgproc::LINE_8, 0)?;

        let caption = format!("{} {:.2}", detection.class_name, detection.confidence);
        let origin = Point::new(rect.x, (rect.y - 6).max(12));
        imgproc::put_text(
            frame,
            &caption,
            origin,
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            color,
            1,
            imgproc::LINE_8,
            false,
        )?;
    }
    Ok(())
}
