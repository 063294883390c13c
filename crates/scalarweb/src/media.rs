// Device status helpers and the media-tree walker.
//
// The walker mirrors the on-camera storage hierarchy: schemes, then sources,
// then a depth-first traversal of folders. Listing is paged (100 entries per
// getContentList call) and lazy: nothing past the current folder is fetched
// until the stream is polled there.

use std::time::Duration;

use async_stream::stream;
use futures::stream::BoxStream;
use serde_json::{Value, json};
use tracing::debug;

use crate::device::SonyDevice;

pub const DEFAULT_AWAIT_TRIES: u32 = 10;
pub const DEFAULT_AWAIT_SLEEP: Duration = Duration::from_secs(1);

const CONTENT_PAGE_LEN: u64 = 100;

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("unexpected response from getEvent: {0}")]
    UnexpectedEventResponse(Value),
    #[error("device state {state:?} not reached after {tries} attempts")]
    StateNotReached { state: String, tries: u32 },
}

/// The current camera status string, e.g. "IDLE" or "ContentsTransfer".
pub async fn get_status(device: &SonyDevice) -> Result<String, DeviceError> {
    let event = device.call("camera", "getEvent", Some(json!([false]))).await;
    let status = event
        .pointer("/result/1/cameraStatus")
        .and_then(Value::as_str);
    match status {
        Some(status) => Ok(status.to_string()),
        None => Err(DeviceError::UnexpectedEventResponse(event)),
    }
}

/// Poll until the camera reaches `state`. Exhausting the attempts is the one
/// device failure that is raised instead of reified.
pub async fn await_state(
    device: &SonyDevice,
    state: &str,
    tries: u32,
    sleep: Duration,
) -> Result<(), DeviceError> {
    for _ in 0..tries {
        if get_status(device).await? == state {
            return Ok(());
        }
        tokio::time::sleep(sleep).await;
    }
    Err(DeviceError::StateNotReached {
        state: state.to_string(),
        tries,
    })
}

/// A file or folder from the walk, paired with the folder path accumulated
/// above it.
pub type MediaEntry = (String, Value);

/// Walk the media hierarchy on the device. Directory entries are yielded
/// like files and then descended into.
pub fn media_walk<'a>(device: &'a SonyDevice, view: &'a str) -> BoxStream<'a, MediaEntry> {
    Box::pin(stream! {
        let schemes = device.call("avContent", "getSchemeList", None).await;
        let schemes = schemes
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut sources: Vec<Value> = Vec::new();
        for scheme in schemes {
            let response = device
                .call("avContent", "getSourceList", Some(scheme))
                .await;
            if let Some(storage) = response
                .pointer("/result/0")
                .and_then(Value::as_array)
            {
                sources.extend(storage.iter().cloned());
            }
        }

        for source in sources {
            let Some(source_uri) = source.get("source").and_then(Value::as_str) else {
                continue;
            };
            let mut stack = vec![(String::new(), source_uri.to_string())];
            while let Some((base, uri)) = stack.pop() {
                let count = content_count(device, &uri, view).await;
                let pages = u64::from(count > 0) + count / CONTENT_PAGE_LEN;
                debug!(uri = uri.as_str(), count, "walking media folder");
                for page in 0..pages {
                    let files = content_list(device, &uri, page * CONTENT_PAGE_LEN, view).await;
                    for file in files {
                        if file.get("contentKind").and_then(Value::as_str) == Some("directory") {
                            let title = file.get("title").and_then(Value::as_str).unwrap_or("");
                            let folder = if base.is_empty() {
                                title.to_string()
                            } else {
                                format!("{base}/{title}")
                            };
                            let child_uri =
                                file.get("uri").and_then(Value::as_str).unwrap_or("");
                            stack.push((folder, child_uri.to_string()));
                        }
                        yield (base.clone(), file);
                    }
                }
            }
        }
    })
}

async fn content_count(device: &SonyDevice, uri: &str, view: &str) -> u64 {
    let response = device
        .call(
            "avContent",
            "getContentCount",
            Some(json!([{"uri": uri, "view": view}])),
        )
        .await;
    response
        .pointer("/result/0/count")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

async fn content_list(device: &SonyDevice, uri: &str, start: u64, view: &str) -> Vec<Value> {
    let response = device
        .call(
            "avContent",
            "getContentList",
            Some(json!([{
                "uri": uri,
                "stIdx": start,
                "cnt": CONTENT_PAGE_LEN,
                "view": view,
            }])),
        )
        .await;
    response
        .pointer("/result/0")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}
