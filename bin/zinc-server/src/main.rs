//! ZincServer - multi-tenant append-only datastore server
//!
//! `start` serves the HTTP/WebSocket API over a storage directory,
//! `generate` writes a datastore filled with random entries and `version`
//! prints the server version.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zinc_common::config::keys;
use zinc_server::generate::{EntryType, GenerateOptions, generate};
use zinc_server::handlers::{AppState, router};
use zinc_server::registry::ServerRegistry;

const DEFAULT_INSECURE_PORT: u16 = 1337;

#[derive(Parser, Debug)]
#[command(name = "zinc-server")]
#[command(about = "ZincServer append-only datastore server")]
#[command(version)]
struct Args {
    /// Log level
    #[arg(long = "logLevel", global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve datastores over HTTP
    Start(StartArgs),
    /// Write a datastore filled with random entries
    Generate(GenerateArgs),
    /// Print the server version
    Version,
}

#[derive(clap::Args, Debug)]
struct StartArgs {
    /// Directory holding the datastore files
    #[arg(long = "storagePath")]
    storage_path: PathBuf,

    /// Port for plain HTTP
    #[arg(long = "insecurePort")]
    insecure_port: Option<u16>,

    /// Port for HTTPS
    #[arg(long = "securePort", requires_all = ["cert_file", "key_file"])]
    secure_port: Option<u16>,

    /// TLS certificate (PEM)
    #[arg(long = "certFile")]
    cert_file: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long = "keyFile")]
    key_file: Option<PathBuf>,

    /// Accept HTTP/2 connections
    #[arg(long = "enableHTTP2", default_value_t = false)]
    enable_http2: bool,

    /// Do not generate a master key when none is configured
    #[arg(long = "noAutoMasterKey", default_value_t = false)]
    no_auto_master_key: bool,
}

#[derive(clap::Args, Debug)]
struct GenerateArgs {
    /// Datastore file to write
    #[arg(long)]
    path: PathBuf,

    /// Number of entries
    #[arg(long = "entryCount", default_value = "1000")]
    entry_count: usize,

    /// Key size in bytes
    #[arg(long = "keySize", default_value = "16")]
    key_size: usize,

    /// Value size in bytes
    #[arg(long = "valueSize", default_value = "100")]
    value_size: usize,

    /// Key and value format
    #[arg(long = "entryType", value_enum, default_value_t = EntryType::Json)]
    entry_type: EntryType,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Commands::Start(start_args) => start(start_args).await,
        Commands::Generate(generate_args) => {
            let options = GenerateOptions {
                path: generate_args.path,
                entry_count: generate_args.entry_count,
                key_size: generate_args.key_size,
                value_size: generate_args.value_size,
                entry_type: generate_args.entry_type,
            };
            tokio::task::spawn_blocking(move || generate(&options)).await??;
            Ok(())
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn start(args: StartArgs) -> Result<()> {
    if args.secure_port.is_some() {
        bail!("HTTPS is not supported by this build; use --insecurePort behind a TLS proxy");
    }

    info!("Starting ZincServer {}", env!("CARGO_PKG_VERSION"));
    info!("Storage path: {}", args.storage_path.display());

    let storage_path = args.storage_path.clone();
    let registry =
        Arc::new(tokio::task::spawn_blocking(move || ServerRegistry::open(storage_path)).await??);

    if !args.no_auto_master_key {
        let setup = Arc::clone(&registry);
        if let Some(key) = tokio::task::spawn_blocking(move || setup.ensure_master_key()).await?? {
            warn!("Generated master key {key}; it is only shown once");
        }
    }

    let loopback_only = registry
        .global_config()?
        .get_bool(keys::HTTP_LOOPBACK_ONLY)
        .unwrap_or(false);
    let ip = if loopback_only {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    let addr = SocketAddr::new(ip, args.insecure_port.unwrap_or(DEFAULT_INSECURE_PORT));
    if args.enable_http2 {
        info!("HTTP/2 enabled (prior knowledge, cleartext)");
    }

    let app = router(Arc::new(AppState::new(registry)));

    info!("Starting HTTP server on {}", addr);
    let listener = TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    })
    .await?;

    info!("ZincServer shut down gracefully");
    Ok(())
}
