//! Signaling server binary.
//!
//! Configuration comes from the environment:
//! - `PINDROP_BIND`: listen address (default `0.0.0.0:9000`)
//! - `REDIS_HOST` / `REDIS_PASSWORD`: session store; without
//!   `REDIS_HOST` the server keeps sessions in memory.
//! - `RUST_LOG`: log filter (default `info`)

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pindrop_signaling::store::SessionStore;
use pindrop_signaling::{MemoryStore, RedisStore, Registry, ServerConfig, SignalingServer};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr: SocketAddr = match std::env::var("PINDROP_BIND") {
        Ok(value) => match value.parse() {
            Ok(addr) => addr,
            Err(e) => {
                error!("invalid PINDROP_BIND {value:?}: {e}");
                std::process::exit(2);
            }
        },
        Err(_) => ([0, 0, 0, 0], 9000).into(),
    };

    if std::env::var("REDIS_HOST").is_ok() {
        match RedisStore::connect_from_env().await {
            Ok(store) => serve(store, addr).await,
            Err(e) => {
                error!("redis connection failed: {e}");
                std::process::exit(1);
            }
        }
    } else {
        info!("REDIS_HOST not set, keeping sessions in memory");
        serve(MemoryStore::default(), addr).await;
    }
}

async fn serve<S: SessionStore>(store: S, addr: SocketAddr) {
    let server = SignalingServer::new(ServerConfig { addr }, Registry::new(store));

    let runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    server.shutdown();

    match runner.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("server error: {e}"),
        Err(e) => error!("server task failed: {e}"),
    }
}
