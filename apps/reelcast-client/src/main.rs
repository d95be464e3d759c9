//! Reelcast Client
//!
//! Connects to a capture node, answers its heartbeats and saves every
//! archive it broadcasts. Received archives are unpacked into
//! `<save_dir>/extracted`.
//!
//! ## Usage
//!
//! ```bash
//! REELCAST_SERVER=192.168.1.20:8080 reelcast-client
//!
//! # Keep archives packed
//! reelcast-client --no-extract
//!
//! # With verbose logging
//! RUST_LOG=reelcast=debug reelcast-client
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use reelcast::client::{
    extract_archive, is_archive, is_video_file, remove_partial_files, ClientConfig,
    ClientDispatcher, DispatchEvent, ReceivedFile,
};

/// Client configuration from environment/args
struct Config {
    client: ClientConfig,
}

impl Config {
    fn from_env() -> Result<Self> {
        let defaults = ClientConfig::default();

        let server_addr: SocketAddr = match std::env::var("REELCAST_SERVER") {
            Ok(s) => s
                .parse()
                .with_context(|| format!("invalid REELCAST_SERVER address {s:?}"))?,
            Err(_) => defaults.server_addr,
        };

        let args: Vec<String> = std::env::args().collect();

        let save_dir = args
            .iter()
            .position(|arg| arg == "--save-dir")
            .and_then(|i| args.get(i + 1))
            .map(PathBuf::from)
            .or_else(|| std::env::var("REELCAST_SAVE_DIR").ok().map(PathBuf::from))
            .unwrap_or(defaults.save_dir);

        let extract_archives = !args.iter().any(|arg| arg == "--no-extract");

        Ok(Self {
            client: ClientConfig {
                server_addr,
                save_dir,
                extract_archives,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env()?.client;

    info!("Reelcast Client starting");
    info!("  Server: {}", config.server_addr);
    info!("  Save dir: {:?}", config.save_dir);
    info!("  Extract archives: {}", config.extract_archives);

    clean_partial_files(&config).await;

    let mut dispatcher = ClientDispatcher::connect(config.server_addr, config.save_dir.clone())
        .await
        .with_context(|| format!("failed to connect to {}", config.server_addr))?;

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            event = dispatcher.next_event() => event,
        };

        match event {
            Ok(DispatchEvent::FileReceived(file)) => {
                if config.extract_archives && is_archive(&file.path) {
                    unpack(&config, file).await;
                }
            }
            Ok(DispatchEvent::TransferAborted) => warn!("Server could not send the file"),
            Ok(DispatchEvent::Rejected { size_bytes }) => {
                warn!("Ignored a {} byte file with an unusable name", size_bytes)
            }
            Ok(DispatchEvent::Pong) => {}
            Ok(DispatchEvent::Quit) | Ok(DispatchEvent::Closed) => {
                info!("Disconnected from server");
                break;
            }
            Err(e) => {
                error!("Connection failed: {}", e);
                break;
            }
        }
    }

    // Interrupted transfers leave their .part file behind
    drop(dispatcher);
    clean_partial_files(&config).await;

    info!("Reelcast Client stopped");
    Ok(())
}

async fn clean_partial_files(config: &ClientConfig) {
    match remove_partial_files(&config.save_dir).await {
        Ok(0) => {}
        Ok(n) => info!("Removed {} partial file(s) from {:?}", n, config.save_dir),
        Err(e) => warn!("Cannot clean {:?}: {}", config.save_dir, e),
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "reelcast=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Extract a received archive off the async runtime and list its videos.
async fn unpack(config: &ClientConfig, file: ReceivedFile) {
    let dest = config.extract_dir();
    let archive = file.path.clone();
    let result = tokio::task::spawn_blocking(move || extract_archive(&archive, &dest)).await;

    match result {
        Ok(Ok(extracted)) => {
            let videos: Vec<_> = extracted.iter().filter(|p| is_video_file(p)).collect();
            info!("{} video file(s) in {}:", videos.len(), file.name);
            for video in videos {
                info!("  {:?}", video);
            }
        }
        Ok(Err(e)) => error!("Failed to extract {}: {}", file.name, e),
        Err(e) => error!("Extraction task failed: {}", e),
    }
}
