//! Local cache and its reducer
//!
//! [`apply`] is the only code that changes a [`CacheState`]. [`StateStore`] owns the live
//! copy, runs the reducer under a short lock and notifies listeners afterwards.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ethers::types::Address;
use parking_lot::Mutex;

use crate::models::{BalanceSnapshot, Order, StatusMessage, TokenInfo, Trade, TransferNotice};
use crate::simple_kv_storage::SledDb;

/// Wallet session state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Trade history state of the selected ticker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HistoryStatus {
    #[default]
    Idle,
    Backfilling,
    /// Backfill finished, live events keep it current
    Live,
    /// Backfill gave up; whatever was merged is kept
    Stale(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LiveStatus {
    #[default]
    Healthy,
    Degraded(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheState {
    /// Bumped on every effective change
    pub revision: u64,
    /// Context generation; tagged actions from older generations are ignored
    pub epoch: u64,
    pub connection: ConnectionStatus,
    pub account: Option<Address>,
    pub chain_id: Option<u64>,
    pub tokens: Vec<TokenInfo>,
    pub selected_ticker: String,
    pub quote_symbol: String,
    /// account -> token -> snapshot
    pub balances: HashMap<Address, HashMap<String, BalanceSnapshot>>,
    pub orders: BTreeMap<u64, Order>,
    /// Selected ticker only, in ledger order
    pub trades: Vec<Trade>,
    trade_ids: HashSet<u64>,
    pub history: HistoryStatus,
    pub live: LiveStatus,
    pub transfer_notice: Option<TransferNotice>,
    pub status: Option<StatusMessage>,
    pub refresh_seq: u64,
}

impl CacheState {
    pub fn new(selected_ticker: &str, quote_symbol: &str) -> Self {
        Self {
            selected_ticker: selected_ticker.to_string(),
            quote_symbol: quote_symbol.to_string(),
            ..Default::default()
        }
    }

    pub fn contains_trade(&self, trade_id: u64) -> bool {
        self.trade_ids.contains(&trade_id)
    }

    fn clear_trades(&mut self) -> bool {
        let changed = !self.trades.is_empty();
        self.trades.clear();
        self.trade_ids.clear();
        changed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Connecting,
    Connected { account: Address, chain_id: u64 },
    /// Account disconnected: everything tied to it or to the ledger view is dropped
    ResetAccount,
    UpdateTokens(Vec<TokenInfo>),
    SelectTicker(String),
    AdvanceEpoch(u64),
    /// Result of async work started in context `epoch`
    Tagged { epoch: u64, action: Box<Action> },
    UpdateBalance(BalanceSnapshot),
    /// Open-order snapshot of both sides of `ticker`
    ReplaceOrders { ticker: String, orders: Vec<Order> },
    InsertTrades(Vec<Trade>),
    BeginBackfill,
    BackfillComplete,
    BackfillFailed(String),
    SetLiveStatus(LiveStatus),
    TransferObserved(TransferNotice),
    ConsumeTransferNotice,
    PostStatus(StatusMessage),
    ConsumeStatus,
    Refresh,
}

impl Action {
    pub fn tagged(epoch: u64, action: Action) -> Self {
        Action::Tagged { epoch, action: Box::new(action) }
    }
}

/// Pure reducer. Returns `state` untouched (same revision) when the action changes nothing.
pub fn apply(mut state: CacheState, action: Action) -> CacheState {
    if reduce(&mut state, action) {
        state.revision += 1;
    }
    state
}

fn reduce(state: &mut CacheState, action: Action) -> bool {
    match action {
        Action::Connecting => replace(&mut state.connection, ConnectionStatus::Connecting),
        Action::Connected { account, chain_id } => {
            let a = replace(&mut state.connection, ConnectionStatus::Connected);
            let b = replace(&mut state.account, Some(account));
            let c = replace(&mut state.chain_id, Some(chain_id));
            a || b || c
        }
        Action::ResetAccount => {
            let mut changed = replace(&mut state.connection, ConnectionStatus::Disconnected);
            changed |= replace(&mut state.account, None);
            changed |= replace(&mut state.chain_id, None);
            changed |= !state.balances.is_empty() || !state.orders.is_empty();
            state.balances.clear();
            state.orders.clear();
            changed |= state.clear_trades();
            changed |= replace(&mut state.history, HistoryStatus::Idle);
            changed |= state.transfer_notice.take().is_some();
            changed
        }
        Action::UpdateTokens(tokens) => replace(&mut state.tokens, tokens),
        Action::SelectTicker(ticker) => {
            if ticker.is_empty() || ticker == state.selected_ticker {
                return false;
            }
            state.selected_ticker = ticker;
            state.clear_trades();
            state.history = HistoryStatus::Idle;
            true
        }
        Action::AdvanceEpoch(epoch) => {
            if epoch <= state.epoch {
                return false;
            }
            state.epoch = epoch;
            true
        }
        Action::Tagged { epoch, action } => epoch == state.epoch && reduce(state, *action),
        Action::UpdateBalance(snapshot) => {
            let per_account = state.balances.entry(snapshot.account).or_default();
            if per_account.get(&snapshot.token) == Some(&snapshot) {
                return false;
            }
            per_account.insert(snapshot.token.clone(), snapshot);
            true
        }
        Action::ReplaceOrders { ticker, orders } => replace_orders(state, &ticker, orders),
        Action::InsertTrades(trades) => {
            let mut changed = false;
            for trade in trades {
                if trade.ticker != state.selected_ticker || !state.trade_ids.insert(trade.trade_id) {
                    continue;
                }
                let at = state.trades.partition_point(|t| t.position <= trade.position);
                state.trades.insert(at, trade);
                changed = true;
            }
            changed
        }
        Action::BeginBackfill => replace(&mut state.history, HistoryStatus::Backfilling),
        Action::BackfillComplete => replace(&mut state.history, HistoryStatus::Live),
        Action::BackfillFailed(reason) => replace(&mut state.history, HistoryStatus::Stale(reason)),
        Action::SetLiveStatus(live) => replace(&mut state.live, live),
        Action::TransferObserved(notice) => replace(&mut state.transfer_notice, Some(notice)),
        Action::ConsumeTransferNotice => state.transfer_notice.take().is_some(),
        Action::PostStatus(status) => replace(&mut state.status, Some(status)),
        Action::ConsumeStatus => state.status.take().is_some(),
        Action::Refresh => {
            state.refresh_seq += 1;
            true
        }
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// Merges an open-order snapshot. `filled` never decreases and never exceeds `amount`;
/// cached open orders missing from the snapshot were consumed and become fully filled.
fn replace_orders(state: &mut CacheState, ticker: &str, orders: Vec<Order>) -> bool {
    let mut changed = false;
    let mut seen = HashSet::new();
    for order in orders {
        if order.ticker != ticker || order.filled > order.amount {
            continue;
        }
        seen.insert(order.id);
        match state.orders.get_mut(&order.id) {
            Some(existing) => {
                let filled = existing.filled.max(order.filled).min(existing.amount);
                changed |= replace(&mut existing.filled, filled);
            }
            None => {
                state.orders.insert(order.id, order);
                changed = true;
            }
        }
    }
    for order in state.orders.values_mut() {
        if order.ticker == ticker && order.is_open() && !seen.contains(&order.id) {
            order.filled = order.amount;
            changed = true;
        }
    }
    changed
}

type Listener = Arc<dyn Fn(&CacheState) + Send + Sync>;

/// Owner of the live cache. The UI reads snapshots and registers change listeners.
pub struct StateStore {
    state: Mutex<CacheState>,
    listeners: Mutex<BTreeMap<u64, Listener>>,
    next_listener: AtomicU64,
    prefs: Option<SledDb>,
}

impl StateStore {
    pub fn new(initial: CacheState) -> Self {
        Self {
            state: Mutex::new(initial),
            listeners: Mutex::new(BTreeMap::new()),
            next_listener: AtomicU64::new(1),
            prefs: None,
        }
    }

    /// Store whose selected ticker is restored from, and saved to, `prefs`
    pub fn restore(prefs: SledDb, quote_symbol: &str) -> Self {
        let selected = prefs.selected_ticker(quote_symbol);
        log::info!("restored selected ticker {selected}");
        let mut store = Self::new(CacheState::new(&selected, quote_symbol));
        store.prefs = Some(prefs);
        store
    }

    /// Applies `action` and notifies listeners if it changed anything
    pub fn dispatch(&self, action: Action) -> bool {
        let snapshot = {
            let mut state = self.state.lock();
            let before = state.revision;
            *state = apply(std::mem::take(&mut *state), action);
            if state.revision == before {
                return false;
            }
            state.clone()
        };

        let listeners: Vec<Listener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(&snapshot);
        }
        true
    }

    pub fn snapshot(&self) -> CacheState {
        self.state.lock().clone()
    }

    /// Reads without cloning the whole cache
    pub fn read<R>(&self, f: impl FnOnce(&CacheState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Persists the preference, then moves the cache to the new ticker
    pub fn select_ticker(&self, ticker: &str) -> bool {
        if let Some(prefs) = &self.prefs {
            if let Err(e) = prefs.save_selected_ticker(ticker) {
                log::warn!("failed to persist selected ticker {ticker}: {e}");
            }
        }
        self.dispatch(Action::SelectTicker(ticker.to_string()))
    }

    /// `listener` runs after every effective change until the guard is dropped
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&CacheState) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().insert(id, Arc::new(listener));
        ListenerGuard { store: Arc::downgrade(self), id }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

#[must_use = "the listener is removed when the guard is dropped"]
pub struct ListenerGuard {
    store: Weak<StateStore>,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.listeners.lock().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LedgerPosition, Side, StatusLevel, TransferDirection};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    fn account() -> Address {
        Address::repeat_byte(5)
    }

    fn trade(trade_id: u64, ticker: &str, block: u64) -> Trade {
        Trade {
            trade_id,
            order_id: 1,
            ticker: ticker.to_string(),
            trader1: Address::repeat_byte(3),
            trader2: Address::repeat_byte(4),
            amount: Decimal::ONE,
            price: 10,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            position: LedgerPosition::new(block, 0),
        }
    }

    fn order(id: u64, amount: i64, filled: i64) -> Order {
        Order {
            id,
            trader: account(),
            ticker: "BAT".into(),
            side: Side::Buy,
            amount: Decimal::from(amount),
            filled: Decimal::from(filled),
            price: 10,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn balance(token: &str, wallet: i64) -> BalanceSnapshot {
        BalanceSnapshot {
            account: account(),
            token: token.into(),
            wallet_balance: Decimal::from(wallet),
            exchange_balance: Decimal::ZERO,
        }
    }

    #[test]
    fn test_trade_insertion_is_idempotent() {
        let state = CacheState::new("BAT", "DAI");
        let once = apply(state, Action::InsertTrades(vec![trade(42, "BAT", 200)]));
        let twice = apply(once.clone(), Action::InsertTrades(vec![trade(42, "BAT", 200)]));
        assert_eq!(twice.trades.len(), 1);
        assert_eq!(twice.revision, once.revision);
    }

    #[test]
    fn test_trades_kept_in_ledger_order() {
        let state = CacheState::new("BAT", "DAI");
        let state = apply(state, Action::InsertTrades(vec![trade(3, "BAT", 300), trade(1, "BAT", 100)]));
        let state = apply(state, Action::InsertTrades(vec![trade(2, "BAT", 200), trade(9, "REP", 150)]));
        let ids: Vec<u64> = state.trades.iter().map(|t| t.trade_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(!state.contains_trade(9));
    }

    #[test]
    fn test_balance_merge_is_per_token() {
        let state = CacheState::new("BAT", "DAI");
        let state = apply(state, Action::UpdateBalance(balance("BAT", 7)));
        let state = apply(state, Action::UpdateBalance(balance("DAI", 1)));
        let state = apply(state, Action::UpdateBalance(balance("DAI", 2)));

        let per_account = &state.balances[&account()];
        assert_eq!(per_account["BAT"].wallet_balance, Decimal::from(7));
        assert_eq!(per_account["DAI"].wallet_balance, Decimal::from(2));
    }

    #[test]
    fn test_order_snapshot_keeps_filled_monotonic() {
        let state = CacheState::new("BAT", "DAI");
        let state = apply(state, Action::ReplaceOrders { ticker: "BAT".into(), orders: vec![order(1, 10, 6), order(2, 10, 0)] });

        // lower filled is ignored, order 2 vanished so it was consumed
        let state = apply(state, Action::ReplaceOrders { ticker: "BAT".into(), orders: vec![order(1, 10, 3), order(3, 5, 9)] });
        assert_eq!(state.orders[&1].filled, Decimal::from(6));
        assert_eq!(state.orders[&2].filled, Decimal::from(10));
        assert!(!state.orders.contains_key(&3));
        assert!(state.orders.values().all(|o| o.filled <= o.amount));
    }

    #[test]
    fn test_stale_tagged_action_is_noop() {
        let state = apply(CacheState::new("BAT", "DAI"), Action::AdvanceEpoch(2));
        let stale = apply(state.clone(), Action::tagged(1, Action::InsertTrades(vec![trade(1, "BAT", 1)])));
        assert_eq!(stale, state);

        let current = apply(state, Action::tagged(2, Action::InsertTrades(vec![trade(1, "BAT", 1)])));
        assert_eq!(current.trades.len(), 1);

        // epochs never go back
        let back = apply(current.clone(), Action::AdvanceEpoch(1));
        assert_eq!(back.epoch, 2);
    }

    #[test]
    fn test_select_ticker_drops_old_history() {
        let state = apply(CacheState::new("BAT", "DAI"), Action::InsertTrades(vec![trade(1, "BAT", 1)]));
        let state = apply(state, Action::BeginBackfill);
        let state = apply(state, Action::SelectTicker("REP".into()));
        assert!(state.trades.is_empty());
        assert!(!state.contains_trade(1));
        assert_eq!(state.history, HistoryStatus::Idle);

        let same = apply(state.clone(), Action::SelectTicker("REP".into()));
        assert_eq!(same.revision, state.revision);
    }

    #[test]
    fn test_reset_account_clears_everything_tied_to_it() {
        let state = CacheState::new("BAT", "DAI");
        let state = apply(state, Action::Connected { account: account(), chain_id: 97 });
        let state = apply(state, Action::UpdateBalance(balance("BAT", 1)));
        let state = apply(state, Action::InsertTrades(vec![trade(1, "BAT", 1)]));
        let state = apply(
            state,
            Action::TransferObserved(TransferNotice {
                token: "DAI".into(),
                direction: TransferDirection::Deposit,
                timestamp: Utc::now(),
            }),
        );
        let state = apply(state, Action::ResetAccount);

        assert_eq!(state.connection, ConnectionStatus::Disconnected);
        assert!(state.account.is_none());
        assert!(state.balances.is_empty());
        assert!(state.trades.is_empty());
        assert!(state.transfer_notice.is_none());
        assert_eq!(state.selected_ticker, "BAT");
    }

    #[test]
    fn test_one_shot_fields_are_consumed() {
        let state = apply(
            CacheState::new("BAT", "DAI"),
            Action::PostStatus(StatusMessage::new("Market Order Filled", StatusLevel::Success)),
        );
        let state = apply(state, Action::ConsumeStatus);
        assert!(state.status.is_none());
        let again = apply(state.clone(), Action::ConsumeStatus);
        assert_eq!(again.revision, state.revision);
    }

    #[test]
    fn test_listeners_see_only_effective_changes() {
        let store = Arc::new(StateStore::new(CacheState::new("BAT", "DAI")));
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let guard = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(store.dispatch(Action::InsertTrades(vec![trade(1, "BAT", 1)])));
        assert!(!store.dispatch(Action::InsertTrades(vec![trade(1, "BAT", 1)])));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        drop(guard);
        assert_eq!(store.listener_count(), 0);
        store.dispatch(Action::Refresh);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_selected_ticker_is_persisted() {
        let prefs = SledDb::temporary().unwrap();
        let store = StateStore::restore(prefs, "DAI");
        assert_eq!(store.read(|s| s.selected_ticker.clone()), "DAI");
        assert!(store.select_ticker("ZRX"));
        assert_eq!(store.prefs.as_ref().unwrap().selected_ticker("DAI"), "ZRX");
    }
}
