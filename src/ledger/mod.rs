//! Ledger access
//!
//! The remote ledger is only reached through [`LedgerClient`] (reads, range scans,
//! push subscriptions) and [`LedgerWriter`] (order/transfer intents).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::Address;

use crate::error::SyncResult;
use crate::models::{LedgerPosition, Side};

pub mod abi;
pub mod ethers_client;
pub mod mock;
pub mod writer;

pub use ethers_client::EthersLedgerClient;
pub use mock::MockLedger;
pub use writer::{EthersLedgerWriter, LedgerWriter, OrderIntent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Exchange contract `NewTrade`
    NewTrade,
    /// ERC-20 `Transfer` on one of the listed tokens
    Transfer,
}

/// Subscription / range-query key. `symbol` is the ticker for trades and the token for
/// transfers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventFilter {
    pub kind: EventKind,
    pub symbol: String,
}

impl EventFilter {
    pub fn new_trades(ticker: &str) -> Self {
        Self { kind: EventKind::NewTrade, symbol: ticker.to_string() }
    }

    pub fn transfers(token: &str) -> Self {
        Self { kind: EventKind::Transfer, symbol: token.to_string() }
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.symbol)
    }
}

/// Decoded but not yet interpreted ledger event. `fields` are the event parameters in
/// declaration order, indexed ones included.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub kind: EventKind,
    /// Emitting contract
    pub address: Address,
    pub position: LedgerPosition,
    pub fields: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PointQuery {
    /// Registered tokens on the exchange contract
    Tokens,
    /// Open orders for one side of a ticker
    Orders { ticker: String, side: Side },
    /// ERC-20 balance held in the wallet
    WalletBalance { account: Address, token: String },
    /// Balance deposited on the exchange contract
    ExchangeBalance { account: Address, token: String },
}

/// Decoded return values of a point read
pub type PointValue = Vec<Token>;

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerPush {
    Event(RawEvent),
    /// The push channel died; no more events will arrive on this handle
    Lost(String),
}

pub type PushCallback = Arc<dyn Fn(LedgerPush) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub filter: EventFilter,
}

/// Read side of the remote ledger.
///
/// Every call may fail with a transport error. All calls except `subscribe` are
/// idempotent; a handle returned by `subscribe` must be released with `unsubscribe`,
/// after which the callback is guaranteed not to fire again.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn point_read(&self, query: &PointQuery) -> SyncResult<PointValue>;

    /// Events matching `filter` in the inclusive block range, in ledger order
    async fn range_query(
        &self,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> SyncResult<Vec<RawEvent>>;

    async fn subscribe(
        &self,
        filter: &EventFilter,
        callback: PushCallback,
    ) -> SyncResult<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> SyncResult<()>;

    async fn current_block_height(&self) -> SyncResult<u64>;
}
