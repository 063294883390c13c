// Persistent device cache.
//
// Hydrating a device proxy costs a description fetch plus a full catalog
// probe, so proxies are kept across runs, keyed by the sorted SSDP header
// tuple. The store is a versioned JSON file written on explicit shutdown;
// anything unreadable resets to an empty cache.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use qxcam_scalarweb::{DeviceRecord, SonyDevice};
use qxcam_ssdp::{DiscoveryRecord, SsdpDiscoverer};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const CACHE_FORMAT_VERSION: u32 = 1;

type CacheKey = Vec<(String, String)>;

#[derive(Serialize, Deserialize, Default)]
struct SerializedCache {
    version: u32,
    devices: Vec<SerializedEntry>,
}

#[derive(Serialize, Deserialize)]
struct SerializedEntry {
    headers: CacheKey,
    device: DeviceRecord,
}

/// `$XDG_RUNTIME_DIR/sony_device_cache` when the runtime dir is set, else a
/// dotfile in the working directory.
pub fn default_cache_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => Path::new(&dir).join("sony_device_cache"),
        None => PathBuf::from(".sony_device_cache"),
    }
}

pub struct DeviceCache {
    path: PathBuf,
    entries: HashMap<CacheKey, Arc<SonyDevice>>,
}

impl DeviceCache {
    pub fn load_default() -> Self {
        Self::load(default_cache_path())
    }

    /// Read the cache from disk. A missing file is an empty cache; a corrupt
    /// or incompatible file resets to empty with a warning, never an error.
    pub fn load(path: PathBuf) -> Self {
        let entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("unable to read device cache {path:?}: {e:#}");
                HashMap::new()
            }
        };
        debug!(path = ?path, devices = entries.len(), "loaded device cache");
        Self { path, entries }
    }

    /// Write the cache back to disk (tmp file, then rename).
    pub fn persist(&self) -> anyhow::Result<()> {
        let db = SerializedCache {
            version: CACHE_FORMAT_VERSION,
            devices: self
                .entries
                .iter()
                .map(|(headers, device)| SerializedEntry {
                    headers: headers.clone(),
                    device: device.to_record(),
                })
                .collect(),
        };
        let tmp = self.path.with_extension("tmp");
        let buf = serde_json::to_vec(&db).context("error serializing device cache")?;
        std::fs::write(&tmp, &buf).with_context(|| format!("error writing {tmp:?}"))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("error renaming {tmp:?} to {:?}", self.path))?;
        debug!(path = ?self.path, devices = self.entries.len(), "wrote device cache");
        Ok(())
    }

    /// Scan the network for Sony imaging devices. Known records reuse their
    /// hydrated proxy; new ones fetch and probe the device.
    pub async fn scan(&mut self, discoverer: &Arc<SsdpDiscoverer>) -> Vec<Arc<SonyDevice>> {
        let disc = discoverer.clone();
        let records = match tokio::task::spawn_blocking(move || disc.query()).await {
            Ok(records) => records,
            Err(e) => {
                warn!("SSDP query task failed: {e}");
                Vec::new()
            }
        };
        let mut devices = Vec::new();
        let mut seen_locations = HashSet::new();
        for record in records {
            if !is_sony_imaging_device(&record) {
                continue;
            }
            let Some(location) = record.get("location").cloned() else {
                continue;
            };
            if !seen_locations.insert(location.clone()) {
                continue;
            }
            let key = cache_key(&record);
            if let Some(device) = self.entries.get(&key) {
                debug!(location = location.as_str(), "device cache hit");
                devices.push(device.clone());
                continue;
            }
            match SonyDevice::connect(&location).await {
                Ok(device) => {
                    let device = Arc::new(device);
                    self.entries.insert(key, device.clone());
                    devices.push(device);
                }
                Err(e) => warn!(location = location.as_str(), "failed to set up device: {e:#}"),
            }
        }
        devices
    }

    /// First device whose name contains `name` (case-insensitive). An empty
    /// `name` matches any device; the network is scanned only when the cache
    /// is empty.
    pub async fn find(
        &mut self,
        discoverer: &Arc<SsdpDiscoverer>,
        name: &str,
    ) -> Option<Arc<SonyDevice>> {
        if self.entries.is_empty() {
            return self.scan(discoverer).await.into_iter().next();
        }
        if name.is_empty() {
            return self.entries.values().next().cloned();
        }
        let needle = name.to_lowercase();
        self.entries
            .values()
            .find(|device| device.device_name.to_lowercase().contains(&needle))
            .cloned()
    }

    pub fn devices(&self) -> Vec<Arc<SonyDevice>> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn read_entries(path: &Path) -> anyhow::Result<HashMap<CacheKey, Arc<SonyDevice>>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e).context("error reading cache file"),
    };
    let db: SerializedCache =
        serde_json::from_slice(&bytes).context("error deserializing device cache")?;
    if db.version != CACHE_FORMAT_VERSION {
        anyhow::bail!("unsupported cache format version {}", db.version);
    }
    let mut entries = HashMap::new();
    for entry in db.devices {
        let device =
            SonyDevice::from_record(entry.device).context("error rebuilding cached device")?;
        entries.insert(entry.headers, Arc::new(device));
    }
    Ok(entries)
}

fn cache_key(record: &DiscoveryRecord) -> CacheKey {
    // BTreeMap iteration is already sorted by header name.
    record
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn is_sony_imaging_device(record: &DiscoveryRecord) -> bool {
    record
        .get("server")
        .map(|server| server.contains("SonyImagingDevice"))
        .unwrap_or(false)
        && record.contains_key("location")
}

#[cfg(test)]
mod tests {
    use super::*;
    use qxcam_scalarweb::{ScalarWebApi, ScalarWebService};

    fn test_record(name: &str) -> DeviceRecord {
        DeviceRecord {
            device_name: name.to_string(),
            device_version: "1.0".to_string(),
            location: "http://10.0.0.2:64321/dd.xml".to_string(),
            webapi: ScalarWebApi {
                services: vec![ScalarWebService {
                    service_type: "camera".to_string(),
                    base_url: "http://10.0.0.2:10000/sony".to_string(),
                }],
                liveview_url: String::new(),
                default_function: String::new(),
            },
            endpoints: Default::default(),
        }
    }

    fn cache_with_device(path: PathBuf, name: &str) -> DeviceCache {
        let mut cache = DeviceCache::load(path);
        let device = Arc::new(SonyDevice::from_record(test_record(name)).unwrap());
        cache.entries.insert(
            vec![("server".into(), "SonyImagingDevice".into())],
            device,
        );
        cache
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sony_device_cache");
        let cache = cache_with_device(path.clone(), "ILCE-6300");
        cache.persist().unwrap();

        let reloaded = DeviceCache::load(path);
        assert_eq!(reloaded.len(), 1);
        let device = reloaded.devices().pop().unwrap();
        assert_eq!(device.device_name, "ILCE-6300");
    }

    #[test]
    fn test_corrupt_cache_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sony_device_cache");
        std::fs::write(&path, b"not json at all").unwrap();
        let cache = DeviceCache::load(path);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_missing_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DeviceCache::load(dir.path().join("sony_device_cache"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_version_mismatch_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sony_device_cache");
        std::fs::write(&path, br#"{"version": 99, "devices": []}"#).unwrap();
        let cache = DeviceCache::load(path);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_find_matches_name_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = cache_with_device(dir.path().join("sony_device_cache"), "ILCE-6300");
        let discoverer = Arc::new(SsdpDiscoverer::with_timeout(
            qxcam_ssdp::SONY_SERVICE_TYPE,
            std::time::Duration::from_millis(1),
        ));
        let device = cache.find(&discoverer, "ilce").await.unwrap();
        assert_eq!(device.device_name, "ILCE-6300");
        assert!(cache.find(&discoverer, "nothing").await.is_none());
    }
}
