use crate::broadcast;
use crate::config::AppCfg;
use crate::core::engine::{Engine, VenueEndpoints};
use crate::core::logging::setup_logger;
use crate::core::types::VenueId;
use anyhow::Result;
use log::{error, info};
use std::collections::HashMap;
use std::sync::Arc;

fn venue_endpoints(cfg: &AppCfg) -> HashMap<VenueId, VenueEndpoints> {
    let mut endpoints = HashMap::new();
    if cfg.core.binance.enabled {
        endpoints.insert(
            VenueId::Binance,
            VenueEndpoints {
                ws_base_url: cfg.core.binance.ws_base_url.clone(),
                rest_base_url: cfg.core.binance.rest_base_url.clone(),
            },
        );
    }
    if cfg.core.okx.enabled {
        endpoints.insert(
            VenueId::Okx,
            VenueEndpoints {
                ws_base_url: cfg.core.okx.ws_base_url.clone(),
                rest_base_url: cfg.core.okx.rest_base_url.clone(),
            },
        );
    }
    if cfg.core.coinbase.enabled {
        endpoints.insert(
            VenueId::Coinbase,
            VenueEndpoints {
                ws_base_url: cfg.core.coinbase.ws_base_url.clone(),
                rest_base_url: cfg.core.coinbase.rest_base_url.clone(),
            },
        );
    }
    endpoints
}

/// Process entry point (§6): load config, set up logging, bring up the
/// engine for the configured startup symbol, then run the broadcast server
/// until a shutdown signal arrives.
pub async fn run() -> Result<()> {
    let cfg = AppCfg::load()?;
    setup_logger(&cfg.logging)?;

    info!("orderbook-aggregator starting for symbol {}", cfg.symbol);

    let engine = Arc::new(Engine::new(cfg.symbol.clone(), venue_endpoints(&cfg)));
    engine.start().await?;

    let broadcast_cfg = cfg.broadcast.clone();
    let server_engine = Arc::clone(&engine);

    tokio::select! {
        result = broadcast::serve(server_engine, broadcast_cfg) => {
            if let Err(e) = result {
                error!("broadcast server exited with error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    engine.shutdown().await;
    info!("orderbook-aggregator stopped");
    Ok(())
}
