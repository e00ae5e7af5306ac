mod capture;
mod http;
mod mjpeg;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use opencv::core::Mat;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::config::StreamConfig;

pub use http::decode_jpeg;
pub use mjpeg::MjpegDemuxer;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{kind} source {locator:?} unavailable: {reason}")]
    Unavailable {
        kind: SourceKind,
        locator: String,
        reason: String,
    },
    #[error("invalid locator {0:?}")]
    InvalidLocator(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Webcam,
    File,
    Network,
}

impl SourceKind {
    /// Live sources cannot be paused, so a full queue drops frames instead of
    /// waiting.
    pub fn is_live(self) -> bool {
        !matches!(self, SourceKind::File)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Webcam => "webcam",
            SourceKind::File => "file",
            SourceKind::Network => "network",
        };
        f.write_str(name)
    }
}

/// A decoded BGR (or single-channel) image, immutable once produced.
pub struct RawFrame {
    image: Mat,
}

impl RawFrame {
    pub fn new(image: Mat) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &Mat {
        &self.image
    }

    pub fn into_image(self) -> Mat {
        self.image
    }

    pub fn width(&self) -> i32 {
        self.image.cols()
    }

    pub fn height(&self) -> i32 {
        self.image.rows()
    }

    pub fn channels(&self) -> i32 {
        self.image.channels()
    }

    pub fn is_empty(&self) -> bool {
        self.image.empty()
    }

    pub fn try_clone(&self) -> opencv::Result<Self> {
        Ok(Self {
            image: self.image.try_clone()?,
        })
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("channels", &self.channels())
            .finish()
    }
}

pub enum NextFrame {
    Ready(RawFrame),
    /// Nothing buffered yet; try again next tick.
    Pending,
    /// The source is exhausted or its producer died.
    Ended,
}

/// Pull side of a frame producer. `next_frame` never blocks.
pub trait FrameSource: Send {
    fn kind(&self) -> SourceKind;
    fn locator(&self) -> &str;
    fn next_frame(&mut self) -> NextFrame;
}

/// Consumer end of a bounded producer queue.
///
/// Dropping it raises the producer's cancel flag and aborts its task, so
/// frames read after invalidation are never observed.
pub struct QueuedSource {
    kind: SourceKind,
    locator: String,
    frames: mpsc::Receiver<RawFrame>,
    cancel: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl QueuedSource {
    fn new(
        kind: SourceKind,
        locator: String,
        frames: mpsc::Receiver<RawFrame>,
        cancel: Arc<AtomicBool>,
        task: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self {
            kind,
            locator,
            frames,
            cancel,
            task: Some(task),
        }
    }
}

impl FrameSource for QueuedSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn locator(&self) -> &str {
        &self.locator
    }

    fn next_frame(&mut self) -> NextFrame {
        match self.frames.try_recv() {
            Ok(frame) => NextFrame::Ready(frame),
            Err(TryRecvError::Empty) => NextFrame::Pending,
            Err(TryRecvError::Disconnected) => NextFrame::Ended,
        }
    }
}

impl Drop for QueuedSource {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.frames.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        tracing::debug!(kind = %self.kind, source = %self.locator, "frame source released");
    }
}

/// Producer end shared by the capture thread and the network task.
struct FrameSink {
    tx: mpsc::Sender<RawFrame>,
    cancel: Arc<AtomicBool>,
    live: bool,
}

impl FrameSink {
    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || self.tx.is_closed()
    }

    /// Queue a frame from blocking code. Returns false once the consumer is gone.
    fn push_blocking(&self, frame: RawFrame) -> bool {
        if self.live {
            return self.try_push(frame);
        }
        self.tx.blocking_send(frame).is_ok()
    }

    /// Queue a frame from async code. Returns false once the consumer is gone.
    async fn push(&self, frame: RawFrame) -> bool {
        if self.live {
            return self.try_push(frame);
        }
        self.tx.send(frame).await.is_ok()
    }

    fn try_push(&self, frame: RawFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!("frame queue full, dropping frame");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

fn channel(kind: SourceKind, capacity: usize) -> (FrameSink, mpsc::Receiver<RawFrame>, Arc<AtomicBool>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let cancel = Arc::new(AtomicBool::new(false));
    let sink = FrameSink {
        tx,
        cancel: Arc::clone(&cancel),
        live: kind.is_live(),
    };
    (sink, rx, cancel)
}

/// Open `locator` as a source of the given kind and start its producer.
///
/// Must be called from within a tokio runtime. Connection and open failures
/// come back as [`SourceError::Unavailable`].
pub async fn open(
    kind: SourceKind,
    locator: &str,
    config: &StreamConfig,
) -> Result<Box<dyn FrameSource>, SourceError> {
    let (sink, rx, cancel) = channel(kind, config.queue_capacity);

    let task = match kind {
        SourceKind::Webcam | SourceKind::File => {
            let target = locator.to_string();
            let capture = tokio::task::spawn_blocking(move || capture::open_capture(kind, &target))
                .await
                .map_err(|e| SourceError::Unavailable {
                    kind,
                    locator: locator.to_string(),
                    reason: e.to_string(),
                })??;
            capture::spawn(capture, kind, locator.to_string(), sink)
        }
        SourceKind::Network => {
            let response = http::connect(locator, config).await?;
            http::spawn(response, locator.to_string(), config.max_frame_bytes, sink)
        }
    };

    tracing::info!(kind = %kind, source = %locator, "frame source opened");
    Ok(Box::new(QueuedSource::new(
        kind,
        locator.to_string(),
        rx,
        cancel,
        task,
    )))
}
