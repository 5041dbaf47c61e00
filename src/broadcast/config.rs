use derive_getters::Getters;
use serde::Deserialize;

/// Configuration for the broadcast server (component F, §4.6).
#[derive(Debug, Clone, Deserialize, Getters)]
pub struct BroadcastCfg {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cadence_ms")]
    pub cadence_ms: u64,
    #[serde(default = "default_top_n")]
    pub default_top_n: usize,
    #[serde(default = "default_bands")]
    pub bands: Vec<f64>,
    #[serde(default = "default_client_queue")]
    pub client_queue_depth: usize,
    #[serde(default = "default_max_full_ticks")]
    pub max_consecutive_full_ticks: u32,
}

fn default_port() -> u16 {
    8080
}
fn default_cadence_ms() -> u64 {
    200
}
fn default_top_n() -> usize {
    20
}
fn default_bands() -> Vec<f64> {
    vec![0.005, 0.02, 0.10]
}
fn default_client_queue() -> usize {
    32
}
fn default_max_full_ticks() -> u32 {
    5
}

impl Default for BroadcastCfg {
    fn default() -> Self {
        Self {
            port: default_port(),
            cadence_ms: default_cadence_ms(),
            default_top_n: default_top_n(),
            bands: default_bands(),
            client_queue_depth: default_client_queue(),
            max_consecutive_full_ticks: default_max_full_ticks(),
        }
    }
}
