//! In-process ledger for tests and offline runs
//!
//! Holds a scripted event history, balances and order lists, and records every call so
//! tests can assert on the exact query sequence. Range queries can be failed per window
//! or held at a gate until released.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, U256};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::{SyncError, SyncResult};
use crate::ledger::{
    EventFilter, EventKind, LedgerClient, LedgerPush, PointQuery, PointValue, PushCallback,
    RawEvent, SubscriptionHandle,
};
use crate::models::units::{bytes32_to_ticker, ticker_to_bytes32};
use crate::models::{LedgerPosition, Side};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    PointRead(PointQuery),
    RangeQuery { filter: EventFilter, from_block: u64, to_block: u64 },
    Subscribe(EventFilter),
    Unsubscribe(u64),
    BlockHeight,
}

#[derive(Default)]
struct MockState {
    history: Vec<RawEvent>,
    wallet_balances: HashMap<(Address, String), U256>,
    exchange_balances: HashMap<(Address, String), U256>,
    orders: HashMap<(String, Side), Vec<Token>>,
    /// window start block -> remaining failures
    window_failures: HashMap<u64, usize>,
    subscribe_failures: usize,
    subscriptions: BTreeMap<u64, (EventFilter, PushCallback)>,
    /// dropped by the ledger but not yet unsubscribed by the client
    lost: BTreeMap<u64, EventFilter>,
    calls: Vec<LedgerCall>,
}

pub struct MockLedger {
    dex_address: Address,
    tokens: BTreeMap<String, Address>,
    tip: AtomicU64,
    next_id: AtomicU64,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    state: Mutex<MockState>,
}

impl MockLedger {
    pub fn new(dex_address: Address, tokens: BTreeMap<String, Address>) -> Self {
        Self {
            dex_address,
            tokens,
            tip: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            gates: Mutex::new(HashMap::new()),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn dex_address(&self) -> Address {
        self.dex_address
    }

    pub fn token_address(&self, symbol: &str) -> Option<Address> {
        self.tokens.get(symbol).copied()
    }

    pub fn set_tip(&self, tip: u64) {
        self.tip.store(tip, Ordering::SeqCst);
    }

    /// Adds an event to history without delivering it live
    pub fn record_event(&self, event: RawEvent) {
        let mut state = self.state.lock();
        let at = state.history.partition_point(|e| e.position <= event.position);
        state.history.insert(at, event);
    }

    /// Adds an event to history and delivers it to every matching live subscription
    pub fn push_event(&self, event: RawEvent) {
        self.record_event(event.clone());
        let targets: Vec<PushCallback> = {
            let state = self.state.lock();
            state
                .subscriptions
                .values()
                .filter(|(filter, _)| self.matches(filter, &event))
                .map(|(_, callback)| callback.clone())
                .collect()
        };
        for callback in targets {
            callback(LedgerPush::Event(event.clone()));
        }
    }

    /// Kills every live subscription, as a dropped connection would. The handles stay
    /// allocated until the client unsubscribes them.
    pub fn drop_subscriptions(&self, reason: &str) {
        let dropped: Vec<PushCallback> = {
            let mut state = self.state.lock();
            let subscriptions = std::mem::take(&mut state.subscriptions);
            let mut callbacks = Vec::with_capacity(subscriptions.len());
            for (id, (filter, callback)) in subscriptions {
                state.lost.insert(id, filter);
                callbacks.push(callback);
            }
            callbacks
        };
        for callback in dropped {
            callback(LedgerPush::Lost(reason.to_string()));
        }
    }

    pub fn set_wallet_balance(&self, account: Address, token: &str, amount: U256) {
        self.state.lock().wallet_balances.insert((account, token.to_string()), amount);
    }

    pub fn set_exchange_balance(&self, account: Address, token: &str, amount: U256) {
        self.state.lock().exchange_balances.insert((account, token.to_string()), amount);
    }

    /// `orders` are `getOrders` tuples, see [`order_tuple`]
    pub fn set_orders(&self, ticker: &str, side: Side, orders: Vec<Token>) {
        self.state.lock().orders.insert((ticker.to_string(), side), orders);
    }

    /// Fails the range query starting at `from_block` the next `times` calls
    pub fn fail_window(&self, from_block: u64, times: usize) {
        self.state.lock().window_failures.insert(from_block, times);
    }

    pub fn fail_subscribe(&self, times: usize) {
        self.state.lock().subscribe_failures = times;
    }

    /// Range queries for `ticker` block until [`MockLedger::release`]
    pub fn hold(&self, ticker: &str) {
        self.gates.lock().insert(ticker.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, ticker: &str) {
        if let Some(gate) = self.gates.lock().remove(ticker) {
            gate.close();
        }
    }

    pub fn calls(&self) -> Vec<LedgerCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count_calls(&self, pred: impl Fn(&LedgerCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn range_queries(&self, ticker: &str) -> Vec<(u64, u64)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                LedgerCall::RangeQuery { filter, from_block, to_block } if filter.symbol == ticker => {
                    Some((*from_block, *to_block))
                }
                _ => None,
            })
            .collect()
    }

    /// Dropped subscriptions whose handle was never released
    pub fn lost_subscriptions(&self) -> Vec<EventFilter> {
        self.state.lock().lost.values().cloned().collect()
    }

    pub fn active_subscriptions(&self) -> Vec<EventFilter> {
        self.state.lock().subscriptions.values().map(|(f, _)| f.clone()).collect()
    }

    fn record(&self, call: LedgerCall) {
        self.state.lock().calls.push(call);
    }

    fn matches(&self, filter: &EventFilter, event: &RawEvent) -> bool {
        if filter.kind != event.kind {
            return false;
        }
        match filter.kind {
            EventKind::NewTrade => {
                event.address == self.dex_address
                    && matches!(event.fields.get(2), Some(Token::FixedBytes(raw))
                        if bytes32_to_ticker(raw).as_deref() == Some(filter.symbol.as_str()))
            }
            EventKind::Transfer => self.token_address(&filter.symbol) == Some(event.address),
        }
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn point_read(&self, query: &PointQuery) -> SyncResult<PointValue> {
        self.record(LedgerCall::PointRead(query.clone()));
        let state = self.state.lock();
        let value = match query {
            PointQuery::Tokens => {
                let tuples = self
                    .tokens
                    .iter()
                    .filter_map(|(symbol, address)| {
                        let ticker = ticker_to_bytes32(symbol)?;
                        Some(Token::Tuple(vec![Token::FixedBytes(ticker.to_vec()), Token::Address(*address)]))
                    })
                    .collect();
                vec![Token::Array(tuples)]
            }
            PointQuery::Orders { ticker, side } => {
                let orders = state.orders.get(&(ticker.clone(), *side)).cloned().unwrap_or_default();
                vec![Token::Array(orders)]
            }
            PointQuery::WalletBalance { account, token } => {
                let amount = state.wallet_balances.get(&(*account, token.clone())).copied();
                vec![Token::Uint(amount.unwrap_or_default())]
            }
            PointQuery::ExchangeBalance { account, token } => {
                let amount = state.exchange_balances.get(&(*account, token.clone())).copied();
                vec![Token::Uint(amount.unwrap_or_default())]
            }
        };
        Ok(value)
    }

    async fn range_query(
        &self,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> SyncResult<Vec<RawEvent>> {
        self.record(LedgerCall::RangeQuery { filter: filter.clone(), from_block, to_block });

        let gate = self.gates.lock().get(&filter.symbol).cloned();
        if let Some(gate) = gate {
            // a closed semaphore means released
            let _ = gate.acquire().await;
        }

        let mut state = self.state.lock();
        if let Some(remaining) = state.window_failures.get_mut(&from_block) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::Transport(format!("window {from_block} unavailable")));
            }
        }
        Ok(state
            .history
            .iter()
            .filter(|e| e.position.block_number >= from_block && e.position.block_number <= to_block)
            .filter(|e| self.matches(filter, e))
            .cloned()
            .collect())
    }

    async fn subscribe(
        &self,
        filter: &EventFilter,
        callback: PushCallback,
    ) -> SyncResult<SubscriptionHandle> {
        self.record(LedgerCall::Subscribe(filter.clone()));
        let mut state = self.state.lock();
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(SyncError::Transport("subscribe refused".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        state.subscriptions.insert(id, (filter.clone(), callback));
        Ok(SubscriptionHandle { id, filter: filter.clone() })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> SyncResult<()> {
        self.record(LedgerCall::Unsubscribe(handle.id));
        let mut state = self.state.lock();
        state.subscriptions.remove(&handle.id);
        state.lost.remove(&handle.id);
        Ok(())
    }

    async fn current_block_height(&self) -> SyncResult<u64> {
        self.record(LedgerCall::BlockHeight);
        Ok(self.tip.load(Ordering::SeqCst))
    }
}

fn wei(amount: u64) -> U256 {
    U256::from(amount) * U256::exp10(18)
}

/// A `NewTrade` event as the exchange contract emits it. `amount` is in whole tokens.
#[allow(clippy::too_many_arguments)]
pub fn new_trade_event(
    dex_address: Address,
    trade_id: u64,
    order_id: u64,
    ticker: &str,
    trader1: Address,
    trader2: Address,
    amount: u64,
    price: u64,
    date: u64,
    position: LedgerPosition,
) -> RawEvent {
    let ticker = ticker_to_bytes32(ticker).unwrap_or_default();
    RawEvent {
        kind: EventKind::NewTrade,
        address: dex_address,
        position,
        fields: vec![
            Token::Uint(U256::from(trade_id)),
            Token::Uint(U256::from(order_id)),
            Token::FixedBytes(ticker.to_vec()),
            Token::Address(trader1),
            Token::Address(trader2),
            Token::Uint(wei(amount)),
            Token::Uint(U256::from(price)),
            Token::Uint(U256::from(date)),
        ],
    }
}

/// An ERC-20 `Transfer` event. `value` is in whole tokens.
pub fn transfer_event(
    token_address: Address,
    from: Address,
    to: Address,
    value: u64,
    position: LedgerPosition,
) -> RawEvent {
    RawEvent {
        kind: EventKind::Transfer,
        address: token_address,
        position,
        fields: vec![Token::Address(from), Token::Address(to), Token::Uint(wei(value))],
    }
}

/// One `getOrders` tuple. `amount` and `filled` are in whole tokens.
#[allow(clippy::too_many_arguments)]
pub fn order_tuple(
    id: u64,
    trader: Address,
    side: Side,
    ticker: &str,
    amount: u64,
    filled: u64,
    price: u64,
    date: u64,
) -> Token {
    let ticker = ticker_to_bytes32(ticker).unwrap_or_default();
    Token::Tuple(vec![
        Token::Uint(U256::from(id)),
        Token::Address(trader),
        Token::Uint(U256::from(side.as_u8())),
        Token::FixedBytes(ticker.to_vec()),
        Token::Uint(wei(amount)),
        Token::Uint(wei(filled)),
        Token::Uint(U256::from(price)),
        Token::Uint(U256::from(date)),
    ])
}
