use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use libqxcam::{CameraServer, CameraServerOptions, make_router};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod erase;
mod snap;
mod transfer;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FolderView {
    Flat,
    Date,
}

impl FolderView {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderView::Flat => "flat",
            FolderView::Date => "date",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreMode {
    /// Leave the picture on the camera only.
    None,
    /// Download the low-latency postview.
    Postview,
    /// Download the original file.
    Original,
}

#[derive(Parser)]
#[command(version, about)]
struct Opts {
    /// The console loglevel (RUST_LOG overrides this).
    #[arg(value_enum, short = 'v', long = "verbosity", env = "QXCAM_LOG_LEVEL")]
    verbosity: Option<LogLevel>,

    #[command(subcommand)]
    subcommand: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Run the network camera web server.
    Server(ServerOpts),
    /// Snap a still picture and optionally download it.
    Snap(snap::SnapOpts),
    /// Download media from the camera.
    Transfer(transfer::TransferOpts),
    /// Erase all media from the camera.
    Erase(erase::EraseOpts),
}

#[derive(clap::Args)]
struct ServerOpts {
    /// Network interface to bind to.
    #[arg(short, long, default_value = "localhost", env = "QXCAM_BIND")]
    bind: String,

    /// The host webserver port.
    #[arg(short, long, default_value = "8080", env = "QXCAM_PORT")]
    port: u16,

    /// Target FPS for each liveview client.
    #[arg(short = 'f', long = "liveview-fps", default_value = "15.0")]
    liveview_fps: f64,

    /// Number of concurrent liveview clients allowed.
    #[arg(short = 't', long = "liveview-threads", default_value = "4")]
    liveview_threads: usize,

    /// Partial name of the Sony device to prefer.
    #[arg(short = 'n', long = "device-name")]
    device_name: Option<String>,

    /// Directory with the static web assets.
    #[arg(long = "static-dir", default_value = "res")]
    static_dir: PathBuf,
}

fn main() {
    let opts = Opts::parse();
    init_logging(opts.verbosity);
    let code = match run(opts) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn init_logging(verbosity: Option<LogLevel>) {
    let default = verbosity.map(|v| v.as_str()).unwrap_or("warn");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(opts: Opts) -> anyhow::Result<i32> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    rt.block_on(async move {
        match opts.subcommand {
            SubCommand::Server(server_opts) => server_main(server_opts).await,
            SubCommand::Snap(snap_opts) => snap::run(snap_opts).await,
            SubCommand::Transfer(transfer_opts) => transfer::run(transfer_opts).await,
            SubCommand::Erase(erase_opts) => erase::run(erase_opts).await,
        }
    })
}

async fn server_main(opts: ServerOpts) -> anyhow::Result<i32> {
    let state = CameraServer::new(CameraServerOptions {
        liveview_fps: opts.liveview_fps,
        max_clients: opts.liveview_threads,
        device_name: opts.device_name,
        cache_path: None,
        static_dir: opts.static_dir,
    })
    .await;

    let app = make_router(state.clone());
    let addr = format!("{}:{}", opts.bind, opts.port);
    let listener = tokio::net::TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("http server error")?;

    state.shutdown().await;
    Ok(0)
}
