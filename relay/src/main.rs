use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::{signal, sync::watch};

use antena_channels::Channel;
use antena_relay::credentials::CredentialCache;
use antena_relay::extract::BrowserExtractor;
use antena_relay::proxy;
use antena_relay::server::{self, AppState};

#[derive(Parser, Debug)]
#[command(name = "antena-relay")]
#[command(about = "Origin relay for geo-restricted radio streams")]
struct Args {
    /// HTTP server port
    #[arg(short, long, default_value = "8090")]
    port: u16,

    /// Run the extraction browser with a visible window (for debugging)
    #[arg(long)]
    headed: bool,

    /// Credential lifetime in minutes
    #[arg(long, default_value = "45")]
    ttl_minutes: u64,

    /// Extract credentials for all authenticated channels at startup
    #[arg(long)]
    prewarm: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Core state: the credential cache is the only shared mutable state in
    // the process, and everything reaches it through the coordinator.
    let extractor = Arc::new(BrowserExtractor::new(!args.headed));
    let cache = Arc::new(CredentialCache::new(
        extractor,
        Duration::from_secs(args.ttl_minutes * 60),
    ));

    let state = AppState {
        cache: Arc::clone(&cache),
        client: proxy::build_client()?,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));

    println!("Relaying {} channels", Channel::ALL.len());
    println!("HTTP server listening on http://localhost:{}", args.port);
    println!();

    let server_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_server(addr, state, shutdown_rx).await {
                eprintln!("[server] Error: {}", e);
            }
        })
    };

    // Warm the credential cache in the background; requests arriving
    // meanwhile coalesce onto the same extractions.
    if args.prewarm {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            println!("[relay] Prewarming credentials...");
            for channel in Channel::authenticated() {
                let ok = cache.get(channel).await.is_some();
                println!("[relay] Prewarm '{}': ok={}", channel, ok);
            }
        });
    }

    // Wait for Ctrl+C
    signal::ctrl_c().await?;
    println!("\nShutting down...");
    let _ = shutdown_tx.send(true);

    let _ = server_handle.await;

    println!("Done.");
    Ok(())
}
