// Take a still picture and store it per --store-mode. The postview URL
// returned by actTakePicture gives no hint of the on-camera file URI, so
// the original-file and delete paths trawl the contents tree for the most
// recently created file.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use futures::StreamExt;
use libqxcam::DeviceCache;
use qxcam_scalarweb::media::{DEFAULT_AWAIT_SLEEP, DEFAULT_AWAIT_TRIES};
use qxcam_scalarweb::{DeviceError, SonyDevice, await_state, get_status, media_walk};
use qxcam_ssdp::{SONY_SERVICE_TYPE, SsdpDiscoverer};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::StoreMode;
use crate::transfer::{download_to, originals};

#[derive(Args)]
pub struct SnapOpts {
    /// Partial name of the Sony device to prefer.
    #[arg(short = 'n', long = "device-name", default_value = "")]
    pub device_name: String,

    /// What to store locally after the shot.
    #[arg(long = "store-mode", value_enum, default_value = "postview")]
    pub store_mode: StoreMode,

    /// Where downloaded pictures are stored.
    #[arg(short = 'o', long = "output-dir", default_value = ".")]
    pub output_dir: PathBuf,

    /// Delete the file from the camera after transferring.
    #[arg(short = 'd', long)]
    pub delete: bool,
}

pub async fn run(opts: SnapOpts) -> anyhow::Result<i32> {
    let discoverer = Arc::new(SsdpDiscoverer::new(SONY_SERVICE_TYPE));
    let mut cache = DeviceCache::load_default();
    let Some(device) = cache.find(&discoverer, &opts.device_name).await else {
        eprintln!("No device found.");
        return Ok(-1);
    };
    let code = match snap_and_store(&device, &opts).await {
        Ok(()) => 0,
        Err(e) if e.is::<DeviceError>() => {
            eprintln!("Imaging device error: {e:#}");
            0
        }
        Err(e) => return Err(e),
    };
    if let Err(e) = cache.persist() {
        warn!("failed to persist device cache: {e:#}");
    }
    Ok(code)
}

async fn snap_and_store(device: &SonyDevice, opts: &SnapOpts) -> anyhow::Result<()> {
    let postview_url = snap_picture(device).await?;
    info!(postview = postview_url.as_str(), "picture taken");
    match opts.store_mode {
        StoreMode::None => {}
        StoreMode::Postview => {
            if postview_url.is_empty() {
                anyhow::bail!("actTakePicture returned no postview URL");
            }
            let target = opts.output_dir.join(postview_file_name(&postview_url));
            download_to(&postview_url, &target).await?;
        }
        StoreMode::Original => store_original(device, opts).await?,
    }
    if opts.delete && opts.store_mode != StoreMode::Original {
        delete_newest(device).await?;
    }
    Ok(())
}

/// Ensure still mode and take one picture; returns the postview URL.
async fn snap_picture(device: &SonyDevice) -> anyhow::Result<String> {
    if get_status(device).await? == "ContentsTransfer" {
        device
            .call("camera", "setCameraFunction", Some(json!(["Remote Shooting"])))
            .await;
        await_state(device, "IDLE", DEFAULT_AWAIT_TRIES, DEFAULT_AWAIT_SLEEP).await?;
    }
    device
        .call("camera", "setShootMode", Some(json!(["still"])))
        .await;
    await_state(device, "IDLE", DEFAULT_AWAIT_TRIES, DEFAULT_AWAIT_SLEEP).await?;
    let response = device.call("camera", "actTakePicture", None).await;
    await_state(device, "IDLE", DEFAULT_AWAIT_TRIES, DEFAULT_AWAIT_SLEEP).await?;
    Ok(response
        .pointer("/result/0/0")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

/// Download the originals of the just-captured (most recent) file, then
/// optionally delete it on the camera.
async fn store_original(device: &SonyDevice, opts: &SnapOpts) -> anyhow::Result<()> {
    let state = get_status(device).await?;
    if state != "ContentsTransfer" {
        device
            .call("camera", "setCameraFunction", Some(json!(["Contents Transfer"])))
            .await;
        await_state(device, "ContentsTransfer", DEFAULT_AWAIT_TRIES, DEFAULT_AWAIT_SLEEP).await?;
    }

    if let Some(file) = newest_file(device).await {
        for original in originals(&file) {
            let Some(file_name) = original.get("fileName").and_then(Value::as_str) else {
                continue;
            };
            let Some(url) = original.get("url").and_then(Value::as_str) else {
                continue;
            };
            download_to(url, &opts.output_dir.join(file_name)).await?;
        }
        if opts.delete {
            if let Some(uri) = file.get("uri").and_then(Value::as_str) {
                info!(uri, "deleting");
                device
                    .call("avContent", "deleteContent", Some(json!([{"uri": [uri]}])))
                    .await;
                await_state(
                    device,
                    "ContentsTransfer",
                    DEFAULT_AWAIT_TRIES,
                    DEFAULT_AWAIT_SLEEP,
                )
                .await?;
            }
        }
    }

    if state != "ContentsTransfer" {
        device
            .call("camera", "setCameraFunction", Some(json!(["Remote Shooting"])))
            .await;
        await_state(device, "IDLE", DEFAULT_AWAIT_TRIES, DEFAULT_AWAIT_SLEEP).await?;
    }
    Ok(())
}

/// Delete the most recently created file on the camera.
async fn delete_newest(device: &SonyDevice) -> anyhow::Result<()> {
    let state = get_status(device).await?;
    if state != "ContentsTransfer" {
        device
            .call("camera", "setCameraFunction", Some(json!(["Contents Transfer"])))
            .await;
        await_state(device, "ContentsTransfer", DEFAULT_AWAIT_TRIES, DEFAULT_AWAIT_SLEEP).await?;
    }

    if let Some(file) = newest_file(device).await {
        if let Some(uri) = file.get("uri").and_then(Value::as_str) {
            info!(uri, "deleting");
            device
                .call("avContent", "deleteContent", Some(json!([{"uri": [uri]}])))
                .await;
            await_state(
                device,
                "ContentsTransfer",
                DEFAULT_AWAIT_TRIES,
                DEFAULT_AWAIT_SLEEP,
            )
            .await?;
        }
    }

    if state != "ContentsTransfer" {
        device
            .call("camera", "setCameraFunction", Some(json!(["Remote Shooting"])))
            .await;
        await_state(device, "IDLE", DEFAULT_AWAIT_TRIES, DEFAULT_AWAIT_SLEEP).await?;
    }
    Ok(())
}

/// The file with the latest createdTime across the whole media tree.
async fn newest_file(device: &SonyDevice) -> Option<Value> {
    let mut walk = media_walk(device, "flat");
    let mut newest: Option<(chrono::DateTime<chrono::FixedOffset>, Value)> = None;
    while let Some((_base, file)) = walk.next().await {
        let Some(created) = file.get("createdTime").and_then(Value::as_str) else {
            continue;
        };
        let Ok(created) = chrono::DateTime::parse_from_rfc3339(created) else {
            continue;
        };
        if newest.as_ref().map(|(t, _)| created > *t).unwrap_or(true) {
            newest = Some((created, file));
        }
    }
    newest.map(|(_, file)| file)
}

fn postview_file_name(url: &str) -> String {
    let name = url
        .rsplit('/')
        .next()
        .and_then(|last| last.split('?').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("postview.jpg");
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postview_file_name() {
        assert_eq!(
            postview_file_name("http://10.0.0.2/postview/pict20240801.jpg"),
            "pict20240801.jpg"
        );
        assert_eq!(
            postview_file_name("http://10.0.0.2/postview/pict.JPG?size=2M"),
            "pict.JPG"
        );
        assert_eq!(postview_file_name("http://10.0.0.2/"), "postview.jpg");
    }
}
