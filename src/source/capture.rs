use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};

use super::{FrameSink, RawFrame, SourceError, SourceKind};

/// Consecutive empty reads tolerated from a camera before giving up on it.
const MAX_CAMERA_MISSES: u32 = 30;

pub(super) fn open_capture(kind: SourceKind, locator: &str) -> Result<VideoCapture, SourceError> {
    let capture = match kind {
        SourceKind::Webcam => {
            let index: i32 = locator
                .trim()
                .parse()
                .map_err(|_| SourceError::InvalidLocator(locator.to_string()))?;
            VideoCapture::new(index, videoio::CAP_ANY)
        }
        SourceKind::File => VideoCapture::from_file(locator, videoio::CAP_ANY),
        SourceKind::Network => return Err(SourceError::InvalidLocator(locator.to_string())),
    };

    let unavailable = |reason: String| SourceError::Unavailable {
        kind,
        locator: locator.to_string(),
        reason,
    };

    let capture = capture.map_err(|e| unavailable(e.to_string()))?;
    if !capture.is_opened().map_err(|e| unavailable(e.to_string()))? {
        return Err(unavailable("could not be opened".to_string()));
    }
    Ok(capture)
}

pub(super) fn spawn(
    mut capture: VideoCapture,
    kind: SourceKind,
    locator: String,
    sink: FrameSink,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut misses = 0u32;
        let mut frames = 0u64;

        while !sink.is_cancelled() {
            let mut image = Mat::default();
            match capture.read(&mut image) {
                Ok(true) if !image.empty() => {
                    misses = 0;
                    frames += 1;
                    if !sink.push_blocking(RawFrame::new(image)) {
                        break;
                    }
                }
                Ok(_) if kind == SourceKind::File => {
                    tracing::info!(source = %locator, frames, "end of file");
                    break;
                }
                Ok(_) => {
                    misses += 1;
                    if misses >= MAX_CAMERA_MISSES {
                        tracing::warn!(source = %locator, misses, "camera stopped delivering frames");
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(source = %locator, error = %e, "capture read failed");
                    break;
                }
            }
        }

        let _ = capture.release();
        tracing::debug!(source = %locator, frames, "capture producer stopped");
    })
}
