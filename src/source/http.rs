use std::time::Duration;

use opencv::core::Vector;
use opencv::imgcodecs;
use opencv::prelude::*;

use crate::config::StreamConfig;

use super::{FrameSink, MjpegDemuxer, RawFrame, SourceError, SourceKind};

pub(super) async fn connect(
    url: &str,
    config: &StreamConfig,
) -> Result<reqwest::Response, SourceError> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(SourceError::InvalidLocator(url.to_string()));
    }

    let unavailable = |reason: String| SourceError::Unavailable {
        kind: SourceKind::Network,
        locator: url.to_string(),
        reason,
    };

    let timeout = Duration::from_secs(config.connect_timeout_secs);
    let client = reqwest::Client::builder().connect_timeout(timeout).build()?;

    let response = tokio::time::timeout(timeout, client.get(url).send())
        .await
        .map_err(|_| unavailable(format!("no response within {}s", timeout.as_secs())))?
        .map_err(|e| unavailable(e.to_string()))?
        .error_for_status()
        .map_err(|e| unavailable(e.to_string()))?;

    tracing::debug!(
        source = %url,
        content_type = ?response.headers().get(reqwest::header::CONTENT_TYPE),
        "connected to stream"
    );
    Ok(response)
}

pub(super) fn spawn(
    mut response: reqwest::Response,
    url: String,
    max_frame_bytes: usize,
    sink: FrameSink,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut demuxer = MjpegDemuxer::with_limit(max_frame_bytes);
        let mut frames = 0u64;
        let mut corrupt = 0u64;

        'read: while !sink.is_cancelled() {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    tracing::info!(source = %url, frames, "stream closed by server");
                    break;
                }
                Err(e) => {
                    tracing::warn!(source = %url, error = %e, "stream read failed");
                    break;
                }
            };

            for jpeg in demuxer.feed(&chunk) {
                match decode_jpeg(&jpeg) {
                    Ok(Some(frame)) => {
                        frames += 1;
                        if !sink.push(frame).await {
                            break 'read;
                        }
                    }
                    Ok(None) => {
                        corrupt += 1;
                        tracing::debug!(source = %url, bytes = jpeg.len(), "skipping undecodable frame");
                    }
                    Err(e) => {
                        corrupt += 1;
                        tracing::debug!(source = %url, error = %e, "skipping undecodable frame");
                    }
                }
            }
        }

        tracing::debug!(
            source = %url,
            frames,
            corrupt,
            dropped = demuxer.dropped_frames(),
            "stream producer stopped"
        );
    })
}

/// Decode one encoded image through OpenCV. `Ok(None)` means the codec
/// rejected the bytes.
pub fn decode_jpeg(bytes: &[u8]) -> opencv::Result<Option<RawFrame>> {
    let buf = Vector::<u8>::from_slice(bytes);
    let image = imgcodecs::imdecode(&buf, imgcodecs::IMREAD_COLOR)?;
    if image.empty() {
        return Ok(None);
    }
    Ok(Some(RawFrame::new(image)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{self, NextFrame};
    use opencv::core::{Mat, Scalar, CV_8UC3};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn encoded_frame(width: i32, height: i32) -> Vec<u8> {
        let mat =
            Mat::new_rows_cols_with_default(height, width, CV_8UC3, Scalar::new(40.0, 120.0, 200.0, 0.0))
                .unwrap();
        let mut buf = Vector::<u8>::new();
        imgcodecs::imencode(".jpg", &mat, &mut buf, &Vector::<i32>::new()).unwrap();
        buf.to_vec()
    }

    fn multipart_body(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        for frame in frames {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(frame);
            body.extend_from_slice(b"\r\n");
        }
        body
    }

    #[test]
    fn test_decode_demuxed_frames() {
        let body = multipart_body(&[encoded_frame(64, 48), encoded_frame(32, 16)]);
        let mut demuxer = MjpegDemuxer::new();
        let mut decoded = Vec::new();
        for chunk in body.chunks(1024) {
            for jpeg in demuxer.feed(chunk) {
                decoded.push(decode_jpeg(&jpeg).unwrap().unwrap());
            }
        }
        assert_eq!(decoded.len(), 2);
        assert_eq!((decoded[0].width(), decoded[0].height()), (64, 48));
        assert_eq!((decoded[1].width(), decoded[1].height()), (32, 16));
    }

    #[test]
    fn test_corrupt_frame_does_not_decode() {
        let result = decode_jpeg(&[0xFF, 0xD8, 0x00, 0x01, 0xFF, 0xD9]);
        assert!(!matches!(result, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_rejects_non_http_locator() {
        let result = connect("rtsp://camera/stream", &StreamConfig::default()).await;
        assert!(matches!(result, Err(SourceError::InvalidLocator(_))));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(&format!("http://{addr}/video"), &StreamConfig::default()).await;
        assert!(matches!(
            result,
            Err(SourceError::Unavailable {
                kind: SourceKind::Network,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_stream_frames_then_exhaustion() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut body = multipart_body(&[encoded_frame(64, 48)]);
        // A corrupt frame in the middle is skipped without ending the stream.
        body.extend_from_slice(&multipart_body(&[vec![0xFF, 0xD8, 0x13, 0x37, 0xFF, 0xD9]]));
        body.extend_from_slice(&multipart_body(&[encoded_frame(64, 48)]));

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await.unwrap();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
                      Connection: close\r\n\r\n",
                )
                .await
                .unwrap();
            for chunk in body.chunks(700) {
                socket.write_all(chunk).await.unwrap();
            }
            socket.shutdown().await.unwrap();
        });

        let url = format!("http://{addr}/video");
        let mut source = source::open(SourceKind::Network, &url, &StreamConfig::default())
            .await
            .unwrap();

        let mut frames = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match source.next_frame() {
                NextFrame::Ready(frame) => {
                    assert_eq!((frame.width(), frame.height()), (64, 48));
                    frames += 1;
                }
                NextFrame::Pending => {
                    assert!(tokio::time::Instant::now() < deadline, "stream stalled");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                NextFrame::Ended => break,
            }
        }
        assert_eq!(frames, 2);
    }
}
