//! The main entry point for the Drive API emulator.
//!
//! This binary initializes logging, builds the in-memory store and serves
//! the router from the library on the requested address.

use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use drivefs_emulator::{AppState, app};

#[derive(Parser, Debug)]
#[command(name = "drivefs-emulator", about = "In-memory emulator of the Drive v2 API")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    address: SocketAddr,
    /// Bearer token clients must present. Any client is admitted when absent.
    #[arg(long)]
    token: Option<String>,
    /// Base URL advertised in download URLs and upload locations.
    #[arg(long)]
    public_url: Option<String>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    // Uses `RUST_LOG` or defaults to "drivefs_emulator=debug,tower_http=debug".
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drivefs_emulator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let public_url = args.public_url.unwrap_or_else(|| format!("http://{}", args.address));
    let state = AppState::new(&public_url, args.token);

    let listener = tokio::net::TcpListener::bind(args.address).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app(state)).await
}
