//! Download-code gateway
//!
//! HTTP front for the dropcode vault: admins issue codes and publish the
//! album, holders check and redeem their codes.

mod auth;
mod config;
mod error;
mod server;

use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::GatewayConfig;
use crate::server::GatewayState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway=info,dropcode=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::from_env()?;

    info!("Starting download-code gateway");
    info!("  Store: {}", config.store);
    info!(
        "  Redeem: {} attempt(s), timeout {:?}",
        config.redeem_policy.max_attempts, config.redeem_policy.timeout
    );
    match &config.site_url {
        Some(url) => info!("  Site URL: {}", url),
        None => info!("  Site URL: derived from request headers"),
    }
    if config.admin_secret.is_none() {
        warn!("ADMIN_SECRET not set: admin endpoints will refuse every request");
    }

    let store = config.open_store().await?;
    let state = Arc::new(GatewayState::new(config, store));

    server::run(state).await
}
