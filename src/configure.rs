use config::{Config, ConfigError, File};
use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    pub currency_symbol: String,
    /// Bids below this amount are rejected at validation.
    pub min_bid_amount: Decimal,
    /// Unresolved (pending + approved) bids a slot holds before admission
    /// starts scanning forward.
    pub max_bids_per_slot: usize,
    /// How many future slots admission scans before overbooking the
    /// current one.
    pub slot_lookahead: usize,
    pub leaderboard_size: usize,
    /// Expiry sweep cadence for the background reconciler.
    pub sweep_interval_secs: u64,
    pub music_api_base: String,
    pub music_cache_ttl_secs: u64,
}

pub fn load_config() -> Result<AppConfig, ConfigError> {
    let s = Config::builder()
        // Defaults mirror the production settings table
        .set_default("log_level", "info")?
        .set_default("log_to_file", false)?
        .set_default("log_file", "log/auction_engine.log")?
        .set_default("currency_symbol", "₹")?
        .set_default("min_bid_amount", "50")?
        .set_default("max_bids_per_slot", 5)?
        .set_default("slot_lookahead", 5)?
        .set_default("leaderboard_size", 10)?
        .set_default("sweep_interval_secs", 15)?
        .set_default("music_api_base", "https://api.deezer.com")?
        .set_default("music_cache_ttl_secs", 300)?
        // Add configuration from a file
        .add_source(File::with_name("config/config.yaml").required(false))
        // Add configuration from environment variables
        .add_source(config::Environment::with_prefix("APP"))
        .build()?;

    s.try_deserialize()
}
