// Server state: the device roster, the active device and its liveview task.
//
// The active-device pointer is read on every request but only written by
// changeDevice, so readers take an arc-swap snapshot and never block.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use qxcam_liveview::LiveviewTask;
use qxcam_scalarweb::SonyDevice;
use qxcam_ssdp::{SONY_SERVICE_TYPE, SsdpDiscoverer};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::device_cache::{DeviceCache, default_cache_path};
use crate::streamer::{DEFAULT_FPS, DEFAULT_MAX_CLIENTS, MjpegStreamer};

pub struct CameraServerOptions {
    pub liveview_fps: f64,
    pub max_clients: usize,
    /// Preferred device name (substring, case-insensitive) at startup.
    pub device_name: Option<String>,
    pub cache_path: Option<PathBuf>,
    /// Directory the static web assets are served from.
    pub static_dir: PathBuf,
}

impl Default for CameraServerOptions {
    fn default() -> Self {
        Self {
            liveview_fps: DEFAULT_FPS,
            max_clients: DEFAULT_MAX_CLIENTS,
            device_name: None,
            cache_path: None,
            static_dir: PathBuf::from("res"),
        }
    }
}

pub struct CameraServer {
    pub(crate) opts: CameraServerOptions,
    discoverer: Arc<SsdpDiscoverer>,
    cache: Mutex<DeviceCache>,
    devices: parking_lot::RwLock<Vec<Arc<SonyDevice>>>,
    active: ArcSwapOption<SonyDevice>,
    /// Last getEvent result array from the active device.
    status: parking_lot::Mutex<Option<Value>>,
    liveview: Mutex<Option<LiveviewTask>>,
    pub(crate) streamer: Arc<MjpegStreamer>,
}

impl CameraServer {
    /// Build the server state, scan for devices and activate one.
    pub async fn new(opts: CameraServerOptions) -> Arc<Self> {
        let server = Self::detached(opts);
        server.refresh_devices().await;
        let initial = {
            let devices = server.devices.read();
            match &server.opts.device_name {
                Some(name) => {
                    let needle = name.to_lowercase();
                    devices
                        .iter()
                        .find(|d| d.device_name.to_lowercase().contains(&needle))
                        .cloned()
                }
                None => devices.first().cloned(),
            }
        };
        match initial {
            Some(device) => {
                let name = device.device_name.clone();
                server.change_device(&name).await;
            }
            None => info!("no Sony imaging device found yet"),
        }
        server
    }

    /// State without the initial scan; used at construction and by tests.
    fn detached(opts: CameraServerOptions) -> Arc<Self> {
        let streamer = MjpegStreamer::new(opts.max_clients, opts.liveview_fps);
        let cache_path = opts.cache_path.clone().unwrap_or_else(default_cache_path);
        Arc::new(Self {
            opts,
            discoverer: Arc::new(SsdpDiscoverer::new(SONY_SERVICE_TYPE)),
            cache: Mutex::new(DeviceCache::load(cache_path)),
            devices: parking_lot::RwLock::new(Vec::new()),
            active: ArcSwapOption::empty(),
            status: parking_lot::Mutex::new(None),
            liveview: Mutex::new(None),
            streamer,
        })
    }

    pub fn active_device(&self) -> Option<Arc<SonyDevice>> {
        self.active.load_full()
    }

    pub fn streamer(&self) -> &Arc<MjpegStreamer> {
        &self.streamer
    }

    pub async fn refresh_devices(&self) -> Vec<Arc<SonyDevice>> {
        let mut cache = self.cache.lock().await;
        let devices = cache.scan(&self.discoverer).await;
        *self.devices.write() = devices.clone();
        devices
    }

    /// Refresh the cached getEvent status. False when there is no active
    /// device or the event call failed.
    async fn update_status(&self) -> bool {
        let Some(device) = self.active_device() else {
            return false;
        };
        let response = device.call("camera", "getEvent", Some(json!([false]))).await;
        match response.get("result") {
            Some(result) => {
                *self.status.lock() = Some(result.clone());
                true
            }
            None => false,
        }
    }

    /// The liveview is available when the device reports
    /// `result[3].liveviewStatus == true` from getEvent.
    pub async fn liveview_available(&self) -> bool {
        if !self.update_status().await {
            return false;
        }
        self.status
            .lock()
            .as_ref()
            .and_then(|status| status.get(3))
            .and_then(|status| status.get("liveviewStatus"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    async fn start_liveview(&self) {
        let Some(device) = self.active_device() else {
            return;
        };
        let response = device.call("camera", "startLiveview", None).await;
        let Some(url) = response
            .pointer("/result/0")
            .and_then(Value::as_str)
        else {
            warn!("startLiveview did not return a stream URL: {response}");
            return;
        };
        let task = LiveviewTask::spawn(url.to_string(), self.streamer.fps(), self.streamer.clone());
        *self.liveview.lock().await = Some(task);
    }

    pub async fn stop_liveview(&self) {
        if let Some(task) = self.liveview.lock().await.take() {
            task.stop().await;
        }
    }

    /// Switch the active device by exact name. Unknown names and the
    /// already-active device are no-ops (the liveview keeps running).
    pub async fn change_device(&self, name: &str) {
        let new_device = self
            .devices
            .read()
            .iter()
            .find(|d| d.device_name == name)
            .cloned();
        let Some(new_device) = new_device else {
            return;
        };
        let current = self
            .active_device()
            .map(|d| d.device_name.clone())
            .unwrap_or_default();
        if new_device.device_name == current {
            return;
        }
        info!(
            from = current.as_str(),
            to = new_device.device_name.as_str(),
            "changing devices"
        );
        self.stop_liveview().await;
        self.active.store(Some(new_device));
        self.update_status().await;
        self.start_liveview().await;
    }

    /// The control plane of the server itself (POST /server).
    pub async fn server_rpc(&self, body: &Value) -> Value {
        match body.get("method").and_then(Value::as_str).unwrap_or("") {
            "getDevices" => {
                let names = self.device_names();
                json!({"error": [0, "Ok"], "result": names})
            }
            "refreshDevices" => {
                self.refresh_devices().await;
                let names = self.device_names();
                json!({"error": [0, "Ok"], "result": names})
            }
            "changeDevice" => {
                let name = body
                    .pointer("/params/0/device")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                self.change_device(name).await;
                json!({"error": [0, "Ok"], "result": Value::Null})
            }
            "getEndpoints" => match self.active_device() {
                None => json!({"error": [404, "No Device Connected"]}),
                Some(device) => {
                    let catalog: serde_json::Map<String, Value> = device
                        .endpoints
                        .iter()
                        .map(|(name, endpoint)| {
                            (
                                name.clone(),
                                serde_json::to_value(&endpoint.methods).unwrap_or_default(),
                            )
                        })
                        .collect();
                    json!({"error": [0, "Ok"], "result": catalog})
                }
            },
            other => json!({"error": [501, format!("Unknown server method {other:?}")]}),
        }
    }

    /// Forward an RPC body to an endpoint on the active device. `None` means
    /// the endpoint is not accessible (HTTP 501 at the facade).
    pub async fn forward_rpc(&self, endpoint: &str, body: Value) -> Option<Value> {
        let Some(device) = self.active_device() else {
            return Some(json!({"error": [404, "No Device Connected"]}));
        };
        if !device.endpoints.contains_key(endpoint) {
            return None;
        }
        let method = body
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if method.is_empty() {
            return Some(json!({"error": [501, "Not Implemented"]}));
        }
        let params = body.get("params").cloned();
        Some(device.call(endpoint, &method, params).await)
    }

    /// Stop the liveview task and write the device cache back.
    pub async fn shutdown(&self) {
        self.stop_liveview().await;
        if let Err(e) = self.cache.lock().await.persist() {
            warn!("failed to persist device cache: {e:#}");
        }
    }

    fn device_names(&self) -> Vec<String> {
        self.devices
            .read()
            .iter()
            .map(|d| d.device_name.clone())
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn test_server() -> Arc<CameraServer> {
    // No scan, no devices; cache path points into a temp dir so tests never
    // touch a real cache file.
    let dir = std::env::temp_dir().join("qxcam-test-cache");
    CameraServer::detached(CameraServerOptions {
        cache_path: Some(dir),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_rpc_get_devices_empty() {
        let server = test_server();
        let response = server.server_rpc(&json!({"method": "getDevices"})).await;
        assert_eq!(response, json!({"error": [0, "Ok"], "result": []}));
    }

    #[tokio::test]
    async fn test_server_rpc_get_endpoints_without_device() {
        let server = test_server();
        let response = server.server_rpc(&json!({"method": "getEndpoints"})).await;
        assert_eq!(response, json!({"error": [404, "No Device Connected"]}));
    }

    #[tokio::test]
    async fn test_server_rpc_unknown_method() {
        let server = test_server();
        let response = server.server_rpc(&json!({"method": "bogus"})).await;
        assert_eq!(response["error"][0], json!(501));
    }

    #[tokio::test]
    async fn test_forward_rpc_without_device_is_reified_404() {
        let server = test_server();
        let response = server
            .forward_rpc("camera", json!({"method": "getEvent"}))
            .await
            .unwrap();
        assert_eq!(response, json!({"error": [404, "No Device Connected"]}));
    }

    #[tokio::test]
    async fn test_change_device_unknown_name_is_a_noop() {
        let server = test_server();
        server.change_device("nothing").await;
        assert!(server.active_device().is_none());
    }

    #[tokio::test]
    async fn test_liveview_unavailable_without_device() {
        let server = test_server();
        assert!(!server.liveview_available().await);
    }
}
