// Sony "Scalar Web API" device control.
//
// A camera advertises itself over SSDP with a `location` URL pointing at a
// UPnP device description. From that description we learn the JSON-RPC
// service endpoints; from the endpoints we learn the per-method catalog.
// Everything network-facing reifies failures as `{"error": [code, msg]}`
// values instead of raising, so callers can forward responses verbatim.

pub mod catalog;
pub mod describe;
pub mod device;
pub mod media;

pub use catalog::{ArgSpec, Expects, MethodSpec};
pub use describe::{DeviceDescription, ScalarWebApi, ScalarWebService, parse_device_description};
pub use device::{DeviceRecord, Endpoint, SonyDevice};
pub use media::{DeviceError, MediaEntry, await_state, get_status, media_walk};
