// Bulk media download: put the camera in Contents Transfer mode, walk its
// storage and dump every original file under the output directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use futures::{StreamExt, TryStreamExt};
use libqxcam::DeviceCache;
use qxcam_scalarweb::media::{DEFAULT_AWAIT_SLEEP, DEFAULT_AWAIT_TRIES};
use qxcam_scalarweb::{SonyDevice, await_state, get_status, media_walk};
use qxcam_ssdp::{SONY_SERVICE_TYPE, SsdpDiscoverer};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::FolderView;

#[derive(Args)]
pub struct TransferOpts {
    /// Partial name of the Sony device to prefer.
    #[arg(short = 'n', long = "device-name", default_value = "")]
    pub device_name: String,

    /// Which layout the media should be dumped in.
    #[arg(short = 'f', long = "folder-view", value_enum, default_value = "flat")]
    pub folder_view: FolderView,

    /// Where the media should be dumped.
    #[arg(short = 'o', long = "output-dir", default_value = ".")]
    pub output_dir: PathBuf,

    /// Overwrite files that already exist locally.
    #[arg(long)]
    pub force: bool,
}

pub async fn run(opts: TransferOpts) -> anyhow::Result<i32> {
    let discoverer = Arc::new(SsdpDiscoverer::new(SONY_SERVICE_TYPE));
    let mut cache = DeviceCache::load_default();
    let Some(device) = cache.find(&discoverer, &opts.device_name).await else {
        eprintln!("No device found.");
        return Ok(-1);
    };
    info!(device = device.device_name.as_str(), "transferring media");
    if let Err(e) = dump_files(&device, &opts).await {
        warn!(
            device = device.device_name.as_str(),
            "device unresponsive: {e:#}"
        );
    }
    if let Err(e) = cache.persist() {
        warn!("failed to persist device cache: {e:#}");
    }
    Ok(0)
}

async fn dump_files(device: &SonyDevice, opts: &TransferOpts) -> anyhow::Result<()> {
    let state = get_status(device).await?;
    if state != "ContentsTransfer" {
        device
            .call("camera", "setCameraFunction", Some(json!(["Contents Transfer"])))
            .await;
        await_state(device, "ContentsTransfer", DEFAULT_AWAIT_TRIES, DEFAULT_AWAIT_SLEEP).await?;
    }

    let out = opts.output_dir.join(&device.device_name);
    tokio::fs::create_dir_all(&out)
        .await
        .with_context(|| format!("failed to create {out:?}"))?;

    let view = opts.folder_view.as_str();
    let mut walk = media_walk(device, view);
    while let Some((folder, file)) = walk.next().await {
        if file.get("contentKind").and_then(Value::as_str) == Some("directory") {
            if opts.folder_view == FolderView::Date {
                let title = file.get("title").and_then(Value::as_str).unwrap_or("");
                let date_dir = out.join(&folder).join(title);
                tokio::fs::create_dir_all(&date_dir)
                    .await
                    .with_context(|| format!("failed to create {date_dir:?}"))?;
            }
            continue;
        }
        for original in originals(&file) {
            let Some(file_name) = original.get("fileName").and_then(Value::as_str) else {
                continue;
            };
            let Some(url) = original.get("url").and_then(Value::as_str) else {
                continue;
            };
            let target = if opts.folder_view == FolderView::Date {
                out.join(&folder).join(file_name)
            } else {
                out.join(file_name)
            };
            if !opts.force && tokio::fs::try_exists(&target).await.unwrap_or(false) {
                info!("skipping existing {target:?}");
                continue;
            }
            if let Err(e) = download_to(url, &target).await {
                warn!("unable to download {url}: {e:#}");
            }
        }
    }
    drop(walk);

    if state != "ContentsTransfer" {
        device
            .call("camera", "setCameraFunction", Some(json!(["Remote Shooting"])))
            .await;
        await_state(device, "IDLE", DEFAULT_AWAIT_TRIES, DEFAULT_AWAIT_SLEEP).await?;
    }
    Ok(())
}

pub fn originals(file: &Value) -> Vec<Value> {
    file.pointer("/content/original")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Stream `url` into `target`, creating parent directories as needed.
pub async fn download_to(url: &str, target: &Path) -> anyhow::Result<()> {
    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("failed to fetch {url}"))?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {parent:?}"))?;
    }
    let mut file = tokio::fs::File::create(target)
        .await
        .with_context(|| format!("failed to create {target:?}"))?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.try_next().await.context("error reading body")? {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("error writing {target:?}"))?;
    }
    file.flush().await?;
    info!("downloaded {url} -> {target:?}");
    Ok(())
}
