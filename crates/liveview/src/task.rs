// The background task that owns one liveview HTTP connection, paces frame
// consumption and feeds decoded frames to a sink.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    COMMON_HEADER_LEN, FrameInfo, PAYLOAD_HEADER_LEN, PayloadHeader, StreamError,
    parse_common_header, parse_frame_info, parse_payload_header,
};

const BACKOFF_SCHEDULE_SECS: [u64; 5] = [1, 2, 4, 8, 16];

/// Receives decoded liveview frames. `add_frame`-style fan-out sinks
/// implement this; frame-info records are optional metadata.
pub trait LiveviewSink: Send + Sync + 'static {
    fn on_jpeg(&self, jpeg: Bytes);
    fn on_frame_info(&self, _info: FrameInfo) {}
}

/// Handle to the background liveview grabber. Dropping the handle does not
/// stop the task; call [`LiveviewTask::stop`] to cancel and join it.
pub struct LiveviewTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl LiveviewTask {
    pub fn spawn(url: String, fps: f64, sink: Arc<dyn LiveviewSink>) -> Self {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(grabber_loop(url, fps, sink, cancel.clone()));
        Self { cancel, join }
    }

    /// Cooperative shutdown: flag the task and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            warn!("liveview task failed: {e}");
        }
    }
}

/// Delay before the `n`th consecutive reconnect attempt: 1, 2, 4, 8 then
/// 16 seconds for every further failure.
pub(crate) fn backoff_delay(consecutive_failures: u32) -> Duration {
    let index = (consecutive_failures as usize).min(BACKOFF_SCHEDULE_SECS.len() - 1);
    Duration::from_secs(BACKOFF_SCHEDULE_SECS[index])
}

async fn grabber_loop(url: String, fps: f64, sink: Arc<dyn LiveviewSink>, cancel: CancellationToken) {
    // No overall timeout: the stream is expected to run until cancelled.
    let client = reqwest::Client::new();
    let mut failures: u32 = 0;
    while !cancel.is_cancelled() {
        match stream_frames(&client, &url, fps, &sink, &cancel, &mut failures).await {
            Ok(()) => break,
            Err(e) => {
                let delay = backoff_delay(failures);
                failures += 1;
                info!("liveview stream failure (retrying in {delay:?}): {e}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    debug!("liveview task exiting");
}

async fn stream_frames(
    client: &reqwest::Client,
    url: &str,
    fps: f64,
    sink: &Arc<dyn LiveviewSink>,
    cancel: &CancellationToken,
    failures: &mut u32,
) -> Result<(), StreamError> {
    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(io_error)?;
    debug!(url, "liveview stream connected");
    let stream = response.bytes_stream().map_err(std::io::Error::other);
    let mut reader = StreamReader::new(stream);
    let frame_interval = Duration::from_secs_f64(1.0 / fps.max(0.001));
    let mut last_frame = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        // Pace the producer: consume no faster than the target frame rate.
        let elapsed = last_frame.elapsed();
        if elapsed < frame_interval {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(frame_interval - elapsed) => {}
            }
        }
        last_frame = Instant::now();

        read_frame(&mut reader, &**sink).await?;
        *failures = 0;
    }
}

/// Read and dispatch exactly one frame: common header, payload header, body
/// and padding.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    sink: &dyn LiveviewSink,
) -> Result<(), StreamError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut common = [0u8; COMMON_HEADER_LEN];
    reader.read_exact(&mut common).await?;
    let common = parse_common_header(&common)?;

    let mut payload = [0u8; PAYLOAD_HEADER_LEN];
    reader.read_exact(&mut payload).await?;
    let payload = parse_payload_header(&payload, common.payload_type)?;

    match payload {
        PayloadHeader::Jpeg { jpeg_data_size, .. } => {
            let mut jpeg = vec![0u8; jpeg_data_size as usize];
            reader.read_exact(&mut jpeg).await?;
            sink.on_jpeg(jpeg.into());
        }
        PayloadHeader::FrameInfo {
            frame_count,
            frame_size,
            ..
        } => {
            let mut record = vec![0u8; frame_size as usize];
            for _ in 0..frame_count {
                reader.read_exact(&mut record).await?;
                sink.on_frame_info(parse_frame_info(&record)?);
            }
        }
    }

    let mut padding = vec![0u8; payload.padding_size() as usize];
    reader.read_exact(&mut padding).await?;
    Ok(())
}

fn io_error(error: reqwest::Error) -> StreamError {
    StreamError::Io(std::io::Error::other(error))
}
