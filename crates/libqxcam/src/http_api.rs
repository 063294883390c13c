// The HTTP facade.
//
// GET /liveview.mjpg            -> multipart/x-mixed-replace MJPEG stream
// GET /{image,video,audio}:content/{uri}  -> media proxied off the device
// POST /server                  -> server control plane
// POST /{endpoint}              -> RPC forwarded to the active device
// anything else (GET)           -> static assets

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Path, RawQuery, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::{BufMut, Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use http::{StatusCode, header};
use serde_json::Value;
use tokio::time::Instant;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::camera_server::CameraServer;
use crate::streamer::StreamClient;
use qxcam_scalarweb::media_walk;

pub const MJPEG_BOUNDARY: &str = "--boundarydonotcross";

const NO_CACHE: &str =
    "no-store, no-cache, must-revalidate, pre-check=0, post-check=0, max-age=0";
const RETRY_AFTER_SECS: &str = "120";

type AppState = Arc<CameraServer>;

pub fn make_router(state: AppState) -> Router {
    let static_dir = state.opts.static_dir.clone();
    Router::new()
        .route("/liveview.mjpg", get(liveview))
        .route("/image:content/{uri}", get(device_media))
        .route("/video:content/{uri}", get(device_media))
        .route("/audio:content/{uri}", get(device_media))
        .route("/server", post(server_rpc))
        .route("/{endpoint}", post(endpoint_rpc))
        .fallback_service(ServeDir::new(static_dir))
        // A GET whose path collides with the POST-only RPC route (e.g.
        // /index.html) still belongs to the static assets.
        .method_not_allowed_fallback(static_assets)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn static_assets(State(state): State<AppState>, request: Request) -> Response {
    match ServeDir::new(&state.opts.static_dir).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn liveview(State(state): State<AppState>) -> Response {
    if !state.liveview_available().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, RETRY_AFTER_SECS)],
        )
            .into_response();
    }
    let Some(client) = state.streamer.activate() else {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, RETRY_AFTER_SECS)],
        )
            .into_response();
    };
    debug!(slot = client.index(), "liveview client connected");
    let body = Body::from_stream(mjpeg_stream(state.clone(), client));
    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace;boundary={MJPEG_BOUNDARY}"),
            ),
            (header::CACHE_CONTROL, NO_CACHE.to_string()),
            (header::PRAGMA, "no-cache".to_string()),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_string()),
        ],
        body,
    )
        .into_response()
}

/// One multipart stream for one client. When the client falls ahead of the
/// target frame rate its slot is released for the duration of the pause so
/// the producer does not queue frames that would only be skipped. Client
/// disconnect drops the stream, and with it the slot.
fn mjpeg_stream(
    state: AppState,
    client: StreamClient,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> {
    async_stream::stream! {
        let mut client = client;
        let frame_interval = state.streamer.frame_interval();
        let idle_timeout = state.streamer.idle_timeout();
        let mut last_part = Instant::now();
        loop {
            let Some(jpeg) = client.frame(idle_timeout).await else {
                yield Ok(closing_boundary());
                break;
            };
            yield Ok(mjpeg_part(&jpeg));
            let elapsed = last_part.elapsed();
            if elapsed < frame_interval {
                drop(client);
                tokio::time::sleep(frame_interval - elapsed).await;
                match state.streamer.activate() {
                    Some(reclaimed) => client = reclaimed,
                    // Admission lost while paused; the stream ends.
                    None => break,
                }
            }
            last_part = Instant::now();
        }
        debug!("liveview client finished");
    }
}

fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let mut part = BytesMut::with_capacity(jpeg.len() + 256);
    part.put_slice(
        format!(
            "--{MJPEG_BOUNDARY}\r\n\
             Content-Type: image/jpeg\r\n\
             Cache-Control: {NO_CACHE}\r\n\
             Content-length: {}\r\n\
             X-Timestamp: {timestamp}\r\n\
             \r\n",
            jpeg.len()
        )
        .as_bytes(),
    );
    part.put_slice(jpeg);
    part.freeze()
}

fn closing_boundary() -> Bytes {
    Bytes::from(format!("--{MJPEG_BOUNDARY}--\r\n"))
}

/// Locate a file on the active device by URI and stream its original back.
/// Device URIs carry a query part ("image:content?contentId=..."), which
/// the HTTP layer splits off the path; glue it back on.
async fn device_media(
    State(state): State<AppState>,
    Path(uri): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let uri = match query {
        Some(query) => format!("{uri}?{query}"),
        None => uri,
    };
    let Some(device) = state.active_device() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let mut walk = media_walk(&device, "flat");
    while let Some((_base, file)) = walk.next().await {
        if file.get("uri").and_then(Value::as_str) != Some(uri.as_str()) {
            continue;
        }
        let Some(url) = file
            .pointer("/content/original/0/url")
            .and_then(Value::as_str)
        else {
            break;
        };
        let mime = media_mime_type(&file);
        return match reqwest::get(url).await.and_then(|r| r.error_for_status()) {
            Ok(response) => {
                let stream = response.bytes_stream().map_err(std::io::Error::other);
                ([(header::CONTENT_TYPE, mime)], Body::from_stream(stream)).into_response()
            }
            Err(e) => {
                warn!("failed to fetch media from device: {e}");
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
        };
    }
    StatusCode::SERVICE_UNAVAILABLE.into_response()
}

fn media_mime_type(file: &Value) -> &'static str {
    let kind = file.get("contentKind").and_then(Value::as_str).unwrap_or("");
    if kind == "still" {
        match file
            .pointer("/content/original/0/stillObject")
            .and_then(Value::as_str)
        {
            Some("jpeg") => "image/jpeg",
            Some("raw") => "image/x-sony-arw",
            _ => "application/octet-stream",
        }
    } else if kind.starts_with("movie") {
        "video/mp4"
    } else {
        "application/octet-stream"
    }
}

async fn server_rpc(State(state): State<AppState>, Json(body): Json<Value>) -> Json<Value> {
    Json(state.server_rpc(&body).await)
}

async fn endpoint_rpc(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    match state.forward_rpc(&endpoint, body).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_server::test_server;
    use http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(path: &str, body: Value) -> Request<Body> {
        Request::post(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_liveview_unavailable_without_device() {
        let app = make_router(test_server());
        let response = app
            .oneshot(Request::get("/liveview.mjpg").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            RETRY_AFTER_SECS
        );
    }

    #[tokio::test]
    async fn test_server_rpc_route() {
        let app = make_router(test_server());
        let response = app
            .oneshot(post("/server", json!({"method": "getDevices"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"error": [0, "Ok"], "result": []})
        );
    }

    #[tokio::test]
    async fn test_endpoint_rpc_without_device() {
        let app = make_router(test_server());
        let response = app
            .oneshot(post("/camera", json!({"method": "getEvent"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"error": [404, "No Device Connected"]})
        );
    }

    #[tokio::test]
    async fn test_media_route_without_device_is_unavailable() {
        let app = make_router(test_server());
        let response = app
            .oneshot(
                Request::get("/image:content/some-uri")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_mjpeg_part_layout() {
        let part = mjpeg_part(b"abc");
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--boundarydonotcross\r\n"));
        assert!(text.contains("Content-Type: image/jpeg\r\n"));
        assert!(text.contains("Content-length: 3\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));
        assert_eq!(closing_boundary(), "--boundarydonotcross--\r\n");
    }

    #[test]
    fn test_media_mime_type_by_kind() {
        let jpeg = json!({"contentKind": "still",
            "content": {"original": [{"stillObject": "jpeg"}]}});
        let raw = json!({"contentKind": "still",
            "content": {"original": [{"stillObject": "raw"}]}});
        let movie = json!({"contentKind": "movie_mp4"});
        assert_eq!(media_mime_type(&jpeg), "image/jpeg");
        assert_eq!(media_mime_type(&raw), "image/x-sony-arw");
        assert_eq!(media_mime_type(&movie), "video/mp4");
        assert_eq!(media_mime_type(&json!({})), "application/octet-stream");
    }
}
