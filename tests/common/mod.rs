#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dex_sync::configure::SyncConfig;
use dex_sync::ledger::mock::{new_trade_event, LedgerCall};
use dex_sync::ledger::{LedgerWriter, MockLedger, PointQuery};
use dex_sync::models::LedgerPosition;
use dex_sync::retry::RetryPolicy;
use dex_sync::sync::{CacheState, Reconciler, StateStore};
use ethers::types::{Address, U256};

pub const DATE: u64 = 1_700_000_000;

pub struct Harness {
    pub mock: Arc<MockLedger>,
    pub store: Arc<StateStore>,
    pub reconciler: Arc<Reconciler>,
    pub account: Address,
}

pub fn tokens() -> BTreeMap<String, Address> {
    let mut tokens = BTreeMap::new();
    tokens.insert("DAI".to_string(), Address::repeat_byte(0x01));
    tokens.insert("BAT".to_string(), Address::repeat_byte(0x02));
    tokens.insert("REP".to_string(), Address::repeat_byte(0x03));
    tokens.insert("ZRX".to_string(), Address::repeat_byte(0x04));
    tokens
}

pub fn sync_config() -> SyncConfig {
    SyncConfig {
        chain_id: 97,
        dex_address: Address::repeat_byte(0x09),
        tokens: tokens(),
        quote_symbol: "DAI".to_string(),
        start_block: 100,
        backfill_window: 50,
        retry: RetryPolicy::new(3, 1, 2, 0.0),
        refresh_coalesce_ms: 0,
        recent_trades_limit: 5,
    }
}

pub fn harness() -> Harness {
    harness_with(StateStore::new(CacheState::new("DAI", "DAI")), None)
}

pub fn harness_with(store: StateStore, writer: Option<Arc<dyn LedgerWriter>>) -> Harness {
    let config = sync_config();
    let mock = Arc::new(MockLedger::new(config.dex_address, config.tokens.clone()));
    mock.set_tip(250);
    let store = Arc::new(store);
    let reconciler = Reconciler::new(config, mock.clone(), writer, store.clone());
    Harness { mock, store, reconciler, account: Address::repeat_byte(0x55) }
}

pub fn other(n: u8) -> Address {
    Address::repeat_byte(0x60 + n)
}

pub fn wei(amount: u64) -> U256 {
    U256::from(amount) * U256::exp10(18)
}

impl Harness {
    pub fn record_trade(&self, trade_id: u64, ticker: &str, block: u64) {
        self.mock.record_event(new_trade_event(
            self.mock.dex_address(),
            trade_id,
            1,
            ticker,
            other(1),
            other(2),
            1,
            10 + trade_id,
            DATE,
            LedgerPosition::new(block, 0),
        ));
    }

    pub fn push_trade(&self, trade_id: u64, ticker: &str, block: u64, trader1: Address, trader2: Address) {
        self.mock.push_event(new_trade_event(
            self.mock.dex_address(),
            trade_id,
            1,
            ticker,
            trader1,
            trader2,
            1,
            10 + trade_id,
            DATE,
            LedgerPosition::new(block, 0),
        ));
    }

    pub fn trade_ids(&self) -> Vec<u64> {
        self.store.read(|s| s.trades.iter().map(|t| t.trade_id).collect())
    }

    pub fn balance_reads(&self, token: &str) -> (usize, usize) {
        let wallet = self.mock.count_calls(|c| {
            matches!(c, LedgerCall::PointRead(PointQuery::WalletBalance { token: t, .. }) if t == token)
        });
        let exchange = self.mock.count_calls(|c| {
            matches!(c, LedgerCall::PointRead(PointQuery::ExchangeBalance { token: t, .. }) if t == token)
        });
        (wallet, exchange)
    }

    pub fn has_balance(&self, token: &str) -> bool {
        let account = self.account;
        self.store
            .read(|s| s.balances.get(&account).is_some_and(|per_token| per_token.contains_key(token)))
    }
}

/// Polls `cond` while letting spawned tasks run
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
