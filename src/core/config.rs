use derive_getters::Getters;
use serde::Deserialize;

/// REST/WS endpoints and enable flag for one venue.
#[derive(Debug, Clone, Deserialize, Getters)]
pub struct VenueCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub ws_base_url: String,
    #[serde(default)]
    pub rest_base_url: String,
}

fn default_enabled() -> bool {
    true
}

impl Default for VenueCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            ws_base_url: String::new(),
            rest_base_url: String::new(),
        }
    }
}

/// Connection settings for every compiled-in venue (§4.8). A venue missing
/// from config, or present with `enabled = false`, is simply not started by
/// the engine - it is not a configuration error.
#[derive(Debug, Clone, Deserialize, Getters, Default)]
pub struct CoreCfg {
    #[serde(default)]
    pub binance: VenueCfg,
    #[serde(default)]
    pub okx: VenueCfg,
    #[serde(default)]
    pub coinbase: VenueCfg,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_venue_cfg_defaults_to_disabled_with_empty_endpoints() {
        let cfg = VenueCfg::default();
        assert!(!cfg.enabled);
        assert!(cfg.ws_base_url.is_empty());
    }
}
