use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::{signal, sync::watch};

use antena_channels::PLAYER_USER_AGENT;

mod cache;
mod routes;

use cache::MemoryCacheStore;
use routes::AppState;

#[derive(Parser, Debug)]
#[command(name = "antena-edge")]
#[command(about = "Edge routing layer in front of the stream relay")]
struct Args {
    /// HTTP server port
    #[arg(short, long, default_value = "8099")]
    port: u16,

    /// Base URL of the origin relay
    #[arg(long, default_value = "http://127.0.0.1:8090")]
    origin: String,

    /// Segment cache TTL in seconds
    #[arg(long, default_value = "30")]
    cache_ttl: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The public provider relocates stream URLs, so fetches must follow
    // redirects.
    let client = reqwest::Client::builder()
        .user_agent(PLAYER_USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(10))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(15))
        .build()?;

    let state = AppState {
        cache: Arc::new(MemoryCacheStore::new()),
        client,
        origin: args.origin.trim_end_matches('/').to_string(),
        cache_ttl: Duration::from_secs(args.cache_ttl),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));

    println!("Edge routing for origin {}", state.origin);
    println!("HTTP server listening on http://localhost:{}", args.port);
    println!();

    let server_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = routes::run_server(addr, state, shutdown_rx).await {
                eprintln!("[edge] Error: {}", e);
            }
        })
    };

    // Wait for Ctrl+C
    signal::ctrl_c().await?;
    println!("\nShutting down...");
    let _ = shutdown_tx.send(true);

    let _ = server_handle.await;

    println!("Done.");
    Ok(())
}
