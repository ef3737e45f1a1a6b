use std::fmt;

use chrono::{DateTime, Utc};
use ethers::types::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Ledger encoding: 0 = BUY, 1 = SELL
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Side::Buy),
            1 => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }
}

/// Where a record was observed in the ledger; sorts in ledger order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LedgerPosition {
    pub block_number: u64,
    pub log_index: u64,
}

impl LedgerPosition {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self { block_number, log_index }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub trader: Address,
    pub ticker: String,
    pub side: Side,
    pub amount: Decimal,
    pub filled: Decimal,
    pub price: u64,
    pub timestamp: DateTime<Utc>,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        (self.amount - self.filled).max(Decimal::ZERO)
    }

    pub fn is_open(&self) -> bool {
        self.filled < self.amount
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: u64,
    pub order_id: u64,
    pub ticker: String,
    pub trader1: Address,
    pub trader2: Address,
    pub amount: Decimal,
    pub price: u64,
    pub timestamp: DateTime<Utc>,
    pub position: LedgerPosition,
}

impl Trade {
    pub fn involves(&self, account: Address) -> bool {
        self.trader1 == account || self.trader2 == account
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub account: Address,
    pub token: String,
    pub wallet_balance: Decimal,
    pub exchange_balance: Decimal,
}

impl BalanceSnapshot {
    pub fn zero(account: Address, token: &str) -> Self {
        Self {
            account,
            token: token.to_string(),
            wallet_balance: Decimal::ZERO,
            exchange_balance: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Deposit,
    Withdraw,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Deposit => write!(f, "Deposit"),
            TransferDirection::Withdraw => write!(f, "Withdraw"),
        }
    }
}

/// One-shot notification, consumed by the UI and then discarded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferNotice {
    pub token: String,
    pub direction: TransferDirection,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenInfo {
    pub symbol: String,
    pub address: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub text: String,
    pub level: StatusLevel,
    pub timestamp: DateTime<Utc>,
}

impl StatusMessage {
    pub fn new(text: impl Into<String>, level: StatusLevel) -> Self {
        Self { text: text.into(), level, timestamp: Utc::now() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainRecord {
    Order(Order),
    Trade(Trade),
    Balance(BalanceSnapshot),
    Transfer(TransferNotice),
}

/// Derived order book for one ticker, never stored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrderBookView {
    pub buy_orders: Vec<Order>,
    pub sell_orders: Vec<Order>,
}
