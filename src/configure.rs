use std::collections::BTreeMap;
use std::str::FromStr;

use config::{Config, ConfigError, File};
use ethers::types::Address;
use serde::Deserialize;

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    pub rpc_url: String,
    pub chain_id: u64,
    pub dex_address: String,
    /// symbol -> ERC-20 contract address
    pub tokens: BTreeMap<String, String>,
    pub quote_symbol: String,
    pub start_block: u64,
    pub backfill_window: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub refresh_coalesce_ms: u64,
    pub recent_trades_limit: usize,
    pub prefs_path: String,
}

pub fn load_config() -> Result<AppConfig, ConfigError> {
    let s = Config::builder()
        // Set defaults
        .set_default("log_level", "info")?
        .set_default("log_to_file", false)?
        .set_default("log_file", "log/dex_sync.log")?
        .set_default("rpc_url", "https://data-seed-prebsc-1-s1.binance.org:8545/")?
        .set_default("chain_id", 97)?
        .set_default("dex_address", "0x7a43f8C2B547Db67800D979577F844F2064d9Ef5")?
        .set_default("tokens.DAI", "0x72fa8918e7dc1714Bd47425342603DA6De45c234")?
        .set_default("tokens.BAT", "0x461c6284412B8d93c265C3204b527fc058450E90")?
        .set_default("tokens.REP", "0x8d2AE25Cafa99d7C18fF1A2247D3685B1600373E")?
        .set_default("tokens.ZRX", "0x4b450e3bD259b58f1F01c1f59b0966925961A11f")?
        .set_default("quote_symbol", "DAI")?
        .set_default("start_block", 18_700_000)?
        .set_default("backfill_window", 4_990)?
        .set_default("retry_max_attempts", 4)?
        .set_default("retry_base_delay_ms", 250)?
        .set_default("retry_max_delay_ms", 5_000)?
        .set_default("refresh_coalesce_ms", 0)?
        .set_default("recent_trades_limit", 5)?
        .set_default("prefs_path", "config_db/prefs")?
        // Add configuration from a file
        .add_source(File::with_name("config/config").required(false))
        // Add configuration from environment variables
        .add_source(config::Environment::with_prefix("APP"))
        .build()?;

    s.try_deserialize()
}

/// Settings the sync engine itself needs, with addresses already parsed.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Network the contracts are deployed on
    pub chain_id: u64,
    pub dex_address: Address,
    pub tokens: BTreeMap<String, Address>,
    pub quote_symbol: String,
    pub start_block: u64,
    pub backfill_window: u64,
    pub retry: RetryPolicy,
    pub refresh_coalesce_ms: u64,
    pub recent_trades_limit: usize,
}

impl SyncConfig {
    pub fn from_app(app: &AppConfig) -> SyncResult<Self> {
        let dex_address = parse_address(&app.dex_address)?;
        let mut tokens = BTreeMap::new();
        for (symbol, address) in &app.tokens {
            tokens.insert(symbol.to_uppercase(), parse_address(address)?);
        }
        let quote_symbol = app.quote_symbol.to_uppercase();
        if !tokens.contains_key(&quote_symbol) {
            return Err(SyncError::Config(format!(
                "quote symbol {quote_symbol} has no token address"
            )));
        }
        if app.backfill_window == 0 {
            return Err(SyncError::Config("backfill_window must be positive".into()));
        }

        Ok(Self {
            chain_id: app.chain_id,
            dex_address,
            tokens,
            quote_symbol,
            start_block: app.start_block,
            backfill_window: app.backfill_window,
            retry: RetryPolicy::new(
                app.retry_max_attempts,
                app.retry_base_delay_ms,
                app.retry_max_delay_ms,
                0.2,
            ),
            refresh_coalesce_ms: app.refresh_coalesce_ms,
            recent_trades_limit: app.recent_trades_limit,
        })
    }

    pub fn token_address(&self, symbol: &str) -> Option<Address> {
        self.tokens.get(symbol).copied()
    }
}

fn parse_address(value: &str) -> SyncResult<Address> {
    Address::from_str(value).map_err(|e| SyncError::Config(format!("bad address {value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> AppConfig {
        let mut tokens = BTreeMap::new();
        tokens.insert("DAI".to_string(), format!("{:?}", Address::repeat_byte(1)));
        tokens.insert("bat".to_string(), format!("{:?}", Address::repeat_byte(2)));
        AppConfig {
            log_level: "info".into(),
            log_to_file: false,
            log_file: "log/test.log".into(),
            rpc_url: "http://localhost:8545".into(),
            chain_id: 97,
            dex_address: format!("{:?}", Address::repeat_byte(9)),
            tokens,
            quote_symbol: "DAI".into(),
            start_block: 100,
            backfill_window: 50,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 4,
            refresh_coalesce_ms: 0,
            recent_trades_limit: 5,
            prefs_path: "config_db/test".into(),
        }
    }

    #[test]
    fn test_sync_config_parses_addresses() {
        let cfg = SyncConfig::from_app(&app()).unwrap();
        assert_eq!(cfg.dex_address, Address::repeat_byte(9));
        assert_eq!(cfg.token_address("BAT"), Some(Address::repeat_byte(2)));
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.chain_id, 97);
    }

    #[test]
    fn test_sync_config_rejects_missing_quote() {
        let mut app = app();
        app.quote_symbol = "USDT".into();
        assert!(matches!(SyncConfig::from_app(&app), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_sync_config_rejects_bad_address() {
        let mut app = app();
        app.dex_address = "not-an-address".into();
        assert!(SyncConfig::from_app(&app).is_err());
    }
}
