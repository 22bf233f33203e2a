//! Standalone Studyboard relay.
//!
//! Configured through `STUDYBOARD_RELAY_ADDR`, `STUDYBOARD_RELAY_TOKEN` and
//! `STUDYBOARD_RELAY_MAX_PEERS`; log level through `RUST_LOG`.

use studyboard_collab::{RelayConfig, SyncRelay};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(2);
        }
    };
    if config.auth_token.is_none() {
        log::warn!("no STUDYBOARD_RELAY_TOKEN set, accepting any token");
    }

    let relay = match SyncRelay::bind(config).await {
        Ok(relay) => relay,
        Err(e) => {
            log::error!("failed to bind relay: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = relay.run().await {
        log::error!("relay stopped: {e}");
        std::process::exit(1);
    }
}
