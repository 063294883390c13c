// The device proxy. Fetches and parses the UPnP description, discovers the
// JSON-RPC endpoints and their method catalogs, and dispatches calls.
//
// RPC failures never raise: every transport, protocol or routing problem
// comes back as a `{"error": [code, message]}` value that mirrors what the
// camera itself would report.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::catalog::{self, MethodSpec, SPECIAL_METHODS};
use crate::describe::{ScalarWebApi, ScalarWebService, parse_device_description};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const ENDPOINT_ID_MAX: u32 = 0x7FFF_FFFF;
const DEFAULT_ENDPOINTS: [&str; 4] = ["guide", "system", "camera", "avContent"];

/// One endpoint family on the device: its method catalog plus the request-id
/// sequence shared by every call posted against it.
pub struct Endpoint {
    pub name: String,
    pub methods: HashMap<String, MethodSpec>,
    next_id: AtomicU32,
}

impl Endpoint {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            methods: HashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Current value then advance, wrapping within [1, 2^31 - 1].
    pub fn next_id(&self) -> u32 {
        self.next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(id % ENDPOINT_ID_MAX + 1)
            })
            .unwrap_or_else(|id| id)
    }

    pub fn current_id(&self) -> u32 {
        self.next_id.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn set_next_id(&self, id: u32) {
        self.next_id.store(id, Ordering::Relaxed);
    }
}

/// Serializable snapshot of a hydrated device, used by the on-disk device
/// cache to rebuild proxies without re-fetching the description XML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_name: String,
    pub device_version: String,
    pub location: String,
    pub webapi: ScalarWebApi,
    pub endpoints: HashMap<String, HashMap<String, MethodSpec>>,
}

pub struct SonyDevice {
    pub device_name: String,
    pub device_version: String,
    pub location: String,
    pub webapi: ScalarWebApi,
    pub endpoints: HashMap<String, Endpoint>,
    http: reqwest::Client,
}

impl std::fmt::Debug for SonyDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SonyDevice:{}@{}", self.device_name, self.location)
    }
}

impl SonyDevice {
    pub async fn connect(location: &str) -> Result<Self> {
        Self::connect_with_timeout(location, DEFAULT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(location: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        let xml = http
            .get(location)
            .send()
            .await
            .with_context(|| format!("failed to fetch device description from {location}"))?
            .error_for_status()
            .context("device description fetch failed")?
            .text()
            .await
            .context("failed to read device description")?;
        let desc = parse_device_description(&xml)
            .with_context(|| format!("bad device description at {location}"))?;
        let mut device = Self {
            device_name: desc.friendly_name,
            device_version: desc.version,
            location: location.to_string(),
            webapi: desc.webapi,
            endpoints: HashMap::new(),
            http,
        };
        device.build_endpoints().await;
        Ok(device)
    }

    /// Rebuild a proxy from a cached record. No network traffic; request-id
    /// sequences restart at 1.
    pub fn from_record(record: DeviceRecord) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        let endpoints = record
            .endpoints
            .into_iter()
            .map(|(name, methods)| {
                let mut endpoint = Endpoint::new(&name);
                endpoint.methods = methods;
                (name, endpoint)
            })
            .collect();
        Ok(Self {
            device_name: record.device_name,
            device_version: record.device_version,
            location: record.location,
            webapi: record.webapi,
            endpoints,
            http,
        })
    }

    pub fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            device_name: self.device_name.clone(),
            device_version: self.device_version.clone(),
            location: self.location.clone(),
            webapi: self.webapi.clone(),
            endpoints: self
                .endpoints
                .iter()
                .map(|(name, endpoint)| (name.clone(), endpoint.methods.clone()))
                .collect(),
        }
    }

    /// Invoke a method through the catalog. Unknown endpoints and methods
    /// resolve to error values without touching the network.
    pub async fn call(&self, endpoint: &str, method: &str, params: Option<Value>) -> Value {
        let Some(ep) = self.endpoints.get(endpoint) else {
            return json!({"error": [504, "No Such API endpoint"], "id": 1});
        };
        let Some(spec) = ep.methods.get(method) else {
            return json!({"error": [501, "Not Implemented"], "id": ep.current_id()});
        };
        let id = ep.next_id();
        let params = params.unwrap_or_else(|| json!([]));
        self.raw_request(endpoint, method, params, id, &spec.version)
            .await
    }

    /// Post one JSON-RPC request, bypassing the catalog.
    pub async fn raw_request(
        &self,
        endpoint: &str,
        method: &str,
        params: Value,
        id: u32,
        version: &str,
    ) -> Value {
        let url = self
            .webapi
            .services
            .iter()
            .find(|s| s.service_type == endpoint)
            .map(|s| format!("{}/{}", s.base_url.trim_end_matches('/'), s.service_type));
        let Some(url) = url else {
            return json!({"error": [504, "No Such API endpoint"], "id": id});
        };
        let body = json!({"method": method, "params": params, "id": id, "version": version});
        debug!(url = url.as_str(), body = %body, "scalar web request");
        let response = match self.http.post(&url).json(&body).send().await {
            Ok(response) => {
                let status = response.status();
                if !status.is_success() {
                    json!({
                        "error": [status.as_u16(), status.canonical_reason().unwrap_or("HTTP error")],
                        "id": id,
                    })
                } else {
                    match response.bytes().await {
                        Ok(bytes) => {
                            // The Sony HDR-AS50 emits invalid JSON (",,") from
                            // accessControl getMethodTypes.
                            let bytes = if endpoint == "accessControl" && method == "getMethodTypes"
                            {
                                collapse_double_commas(&bytes)
                            } else {
                                bytes.to_vec()
                            };
                            match serde_json::from_slice::<Value>(&bytes) {
                                Ok(value) => value,
                                Err(_) => json!({"error": [504, "Invalid data in returned JSON"]}),
                            }
                        }
                        Err(e) => transport_error(e, id),
                    }
                }
            }
            Err(e) => transport_error(e, id),
        };
        debug!(response = %response, "scalar web response");
        response
    }

    async fn build_endpoints(&mut self) {
        let protocols = self
            .raw_request("guide", "getServiceProtocols", json!([]), 1, "1.0")
            .await;
        let names: Vec<String> = match protocols.get("results").and_then(Value::as_array) {
            Some(results) => results
                .iter()
                .filter_map(|entry| entry.get(0))
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            None => DEFAULT_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
        };

        // Every reported endpoint must be backed by a service descriptor;
        // synthesize one on the most common base URL where the description
        // did not list it.
        for name in &names {
            let known = self
                .webapi
                .services
                .iter()
                .any(|s| s.service_type == *name);
            if !known {
                if let Some(base_url) = most_common_base_url(&self.webapi.services) {
                    self.webapi.services.push(ScalarWebService {
                        service_type: name.clone(),
                        base_url,
                    });
                }
            }
        }

        for name in &names {
            let methods = self
                .raw_request(name, "getMethodTypes", json!([""]), 1, "1.0")
                .await;
            let mut endpoint = Endpoint::new(name);
            let mut raw_specs: Vec<(String, Vec<String>)> = Vec::new();
            if let Some(results) = methods.get("results").and_then(Value::as_array) {
                for entry in results {
                    let Some(parts) = entry.as_array() else {
                        continue;
                    };
                    if parts.len() < 4 {
                        continue;
                    }
                    let Some(method_name) = parts[0].as_str() else {
                        continue;
                    };
                    let prms: Vec<String> = parts[1]
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    let version = parts[3].as_str().unwrap_or("1.0").to_string();
                    endpoint.methods.insert(
                        method_name.to_string(),
                        MethodSpec {
                            version,
                            ..Default::default()
                        },
                    );
                    raw_specs.push((method_name.to_string(), prms));
                }
            }
            self.endpoints.insert(name.clone(), endpoint);

            // Second pass: synthesize argument specs, probing getSupported*
            // companions for the option sets.
            for (method_name, prms) in raw_specs {
                let opts = self.find_options(name, &method_name).await;
                let expects = catalog::response_type(&prms);
                let parameters = if SPECIAL_METHODS.contains(&method_name.as_str()) {
                    catalog::special_method_spec(&method_name, &opts)
                } else {
                    catalog::parse_arg_spec(&prms, &opts)
                };
                if let Some(endpoint) = self.endpoints.get_mut(name) {
                    if let Some(spec) = endpoint.methods.get_mut(&method_name) {
                        spec.expects = expects;
                        spec.parameters = parameters;
                    }
                }
            }
        }
    }

    /// For a `set*` method, probe the matching `getSupported*` companion for
    /// the valid option sets.
    async fn find_options(&self, endpoint: &str, method: &str) -> Vec<Value> {
        let Some(rest) = method.strip_prefix("set") else {
            return Vec::new();
        };
        let companion = format!("getSupported{rest}");
        let known = self
            .endpoints
            .get(endpoint)
            .map(|ep| ep.methods.contains_key(&companion))
            .unwrap_or(false);
        if !known {
            return Vec::new();
        }
        let response = self.call(endpoint, &companion, Some(json!([]))).await;
        for key in ["result", "results"] {
            if let Some(options) = response.get(key).and_then(Value::as_array) {
                return options.clone();
            }
        }
        Vec::new()
    }
}

fn transport_error(error: reqwest::Error, id: u32) -> Value {
    if error.is_timeout() {
        json!({"error": [2, "timeout"], "id": id})
    } else {
        json!({"error": [601, error.to_string()], "id": id})
    }
}

/// Single-pass replacement of ",," with ",".
fn collapse_double_commas(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b',' && bytes.get(i + 1) == Some(&b',') {
            out.push(b',');
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

/// The most frequent base URL among the known services, first-seen order
/// breaking ties.
fn most_common_base_url(services: &[ScalarWebService]) -> Option<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for service in services {
        match counts.iter_mut().find(|(url, _)| *url == service.base_url) {
            Some((_, count)) => *count += 1,
            None => counts.push((&service.base_url, 1)),
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for (url, count) in counts {
        match best {
            Some((_, best_count)) if best_count >= count => {}
            _ => best = Some((url, count)),
        }
    }
    best.map(|(url, _)| url.to_string())
}
