// Erase all media on the camera, in deleteContent chunks of at most 100
// URIs per call.

use std::io::Write;
use std::sync::Arc;

use clap::Args;
use futures::StreamExt;
use libqxcam::DeviceCache;
use qxcam_scalarweb::media::{DEFAULT_AWAIT_SLEEP, DEFAULT_AWAIT_TRIES};
use qxcam_scalarweb::{SonyDevice, await_state, get_status, media_walk};
use qxcam_ssdp::{SONY_SERVICE_TYPE, SsdpDiscoverer};
use serde_json::{Value, json};
use tracing::{info, warn};

const DELETE_CHUNK_LEN: usize = 100;

#[derive(Args)]
pub struct EraseOpts {
    /// Partial name of the Sony device to prefer.
    #[arg(short = 'n', long = "device-name", default_value = "")]
    pub device_name: String,

    /// No interactive prompting.
    #[arg(short = 'f', long)]
    pub force: bool,
}

pub async fn run(opts: EraseOpts) -> anyhow::Result<i32> {
    let discoverer = Arc::new(SsdpDiscoverer::new(SONY_SERVICE_TYPE));
    let mut cache = DeviceCache::load_default();
    let Some(device) = cache.find(&discoverer, &opts.device_name).await else {
        eprintln!("No device found.");
        return Ok(-1);
    };
    let proceed = opts.force
        || confirm(&format!(
            "Really erase all files on '{}'?",
            device.device_name
        ))?;
    if proceed {
        info!(device = device.device_name.as_str(), "erasing device");
        if let Err(e) = erase_all_files(&device).await {
            warn!(
                device = device.device_name.as_str(),
                "device unresponsive: {e:#}"
            );
        }
    } else {
        info!("cancelled device erasure");
    }
    if let Err(e) = cache.persist() {
        warn!("failed to persist device cache: {e:#}");
    }
    Ok(0)
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    loop {
        print!("{question} [y/N] ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "" | "n" | "no" => return Ok(false),
            _ => println!("Please respond with 'yes' or 'no'."),
        }
    }
}

async fn erase_all_files(device: &SonyDevice) -> anyhow::Result<()> {
    let state = get_status(device).await?;
    if state != "ContentsTransfer" {
        device
            .call("camera", "setCameraFunction", Some(json!(["Contents Transfer"])))
            .await;
        await_state(device, "ContentsTransfer", DEFAULT_AWAIT_TRIES, DEFAULT_AWAIT_SLEEP).await?;
    }

    let mut uris = Vec::new();
    {
        let mut walk = media_walk(device, "flat");
        while let Some((_base, file)) = walk.next().await {
            if let Some(uri) = file.get("uri").and_then(Value::as_str) {
                uris.push(uri.to_string());
            }
        }
    }
    info!(files = uris.len(), "erasing files");

    for chunk in uris.chunks(DELETE_CHUNK_LEN) {
        device
            .call("avContent", "deleteContent", Some(json!([{"uri": chunk}])))
            .await;
        await_state(
            device,
            "ContentsTransfer",
            DEFAULT_AWAIT_TRIES,
            DEFAULT_AWAIT_SLEEP,
        )
        .await?;
    }

    if state != "ContentsTransfer" {
        device
            .call("camera", "setCameraFunction", Some(json!(["Remote Shooting"])))
            .await;
        await_state(device, "IDLE", DEFAULT_AWAIT_TRIES, DEFAULT_AWAIT_SLEEP).await?;
    }
    Ok(())
}
