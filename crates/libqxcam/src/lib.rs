// Core of the qxcam network camera gateway.
//
// Wiring: the SSDP discoverer and the device cache produce Sony device
// proxies; one of them is active. The HTTP facade forwards control POSTs to
// the active device and serves its liveview as Motion JPEG, fed by a
// background liveview task through the fan-out streamer.

pub mod camera_server;
pub mod device_cache;
pub mod http_api;
pub mod streamer;

pub use camera_server::{CameraServer, CameraServerOptions};
pub use device_cache::{DeviceCache, default_cache_path};
pub use http_api::make_router;
pub use streamer::{MjpegStreamer, StreamClient};
