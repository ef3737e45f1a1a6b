//! Raw ledger data -> domain records
//!
//! Every entry point is total: anything that does not have the expected shape is logged
//! and dropped, never returned as an error.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use ethers::abi::Token;
use ethers::types::{Address, U256};

use crate::ledger::{EventKind, RawEvent};
use crate::models::units::{bytes32_to_ticker, to_decimal, to_integer, to_timestamp};
use crate::models::{
    BalanceSnapshot, DomainRecord, Order, Side, TokenInfo, Trade, TransferDirection, TransferNotice,
};

pub struct EventNormalizer {
    dex_address: Address,
    token_symbols: HashMap<Address, String>,
}

impl EventNormalizer {
    pub fn new(dex_address: Address, tokens: &BTreeMap<String, Address>) -> Self {
        Self {
            dex_address,
            token_symbols: tokens.iter().map(|(symbol, address)| (*address, symbol.clone())).collect(),
        }
    }

    /// `account` is the connected wallet; transfers are only meaningful relative to it.
    pub fn normalize(&self, raw: &RawEvent, account: Option<Address>) -> Option<DomainRecord> {
        let result = match raw.kind {
            EventKind::NewTrade => self.trade(raw).map(|t| Some(DomainRecord::Trade(t))),
            EventKind::Transfer => self
                .transfer(raw, account)
                .map(|notice| notice.map(DomainRecord::Transfer)),
        };
        match result {
            Ok(record) => record,
            Err(reason) => {
                log::warn!(
                    "dropping malformed {:?} event at block {}: {reason}",
                    raw.kind,
                    raw.position.block_number
                );
                None
            }
        }
    }

    fn trade(&self, raw: &RawEvent) -> Result<Trade, String> {
        let f = &raw.fields;
        if f.len() != 8 {
            return Err(format!("expected 8 fields, got {}", f.len()));
        }
        Ok(Trade {
            trade_id: integer(f, 0)?,
            order_id: integer(f, 1)?,
            ticker: ticker(f, 2)?,
            trader1: address(f, 3)?,
            trader2: address(f, 4)?,
            amount: to_decimal(uint(f, 5)?).ok_or("amount out of range")?,
            price: integer(f, 6)?,
            timestamp: to_timestamp(uint(f, 7)?).ok_or("date out of range")?,
            position: raw.position,
        })
    }

    fn transfer(&self, raw: &RawEvent, account: Option<Address>) -> Result<Option<TransferNotice>, String> {
        let f = &raw.fields;
        if f.len() != 3 {
            return Err(format!("expected 3 fields, got {}", f.len()));
        }
        let from = address(f, 0)?;
        let to = address(f, 1)?;
        uint(f, 2)?;
        let token = self
            .token_symbols
            .get(&raw.address)
            .ok_or_else(|| format!("transfer from unlisted token {:?}", raw.address))?;

        let Some(account) = account else {
            return Ok(None);
        };
        let direction = if from == account && to == self.dex_address {
            TransferDirection::Deposit
        } else if from == self.dex_address && to == account {
            TransferDirection::Withdraw
        } else {
            return Ok(None);
        };
        Ok(Some(TransferNotice { token: token.clone(), direction, timestamp: Utc::now() }))
    }

    /// `getOrders` result: a single array of order tuples
    pub fn normalize_orders(&self, value: &[Token]) -> Vec<Order> {
        let Some(Token::Array(items)) = value.first() else {
            log::warn!("dropping malformed order list: {value:?}");
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match order(item) {
                Ok(order) => Some(order),
                Err(reason) => {
                    log::warn!("dropping malformed order: {reason}");
                    None
                }
            })
            .collect()
    }

    /// `getTokens` result: a single array of (bytes32 ticker, address) tuples
    pub fn normalize_tokens(&self, value: &[Token]) -> Vec<TokenInfo> {
        let Some(Token::Array(items)) = value.first() else {
            log::warn!("dropping malformed token list: {value:?}");
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let Token::Tuple(f) = item else { return None };
                Some(TokenInfo { symbol: ticker(f, 0).ok()?, address: address(f, 1).ok()? })
            })
            .collect()
    }

    /// Wallet `balanceOf` and exchange `traderBalances` results for one token
    pub fn normalize_balance(
        &self,
        account: Address,
        token: &str,
        wallet: &[Token],
        exchange: &[Token],
    ) -> Option<BalanceSnapshot> {
        let (Ok(wallet_wei), Ok(exchange_wei)) = (uint(wallet, 0), uint(exchange, 0)) else {
            log::warn!("dropping malformed {token} balance for {account:?}: {wallet:?} / {exchange:?}");
            return None;
        };
        match (to_decimal(wallet_wei), to_decimal(exchange_wei)) {
            (Some(wallet_balance), Some(exchange_balance)) => Some(BalanceSnapshot {
                account,
                token: token.to_string(),
                wallet_balance,
                exchange_balance,
            }),
            _ => {
                log::warn!("{token} balance for {account:?} out of range: {wallet_wei} / {exchange_wei}");
                None
            }
        }
    }
}

fn order(item: &Token) -> Result<Order, String> {
    let Token::Tuple(f) = item else {
        return Err(format!("expected tuple, got {item:?}"));
    };
    if f.len() != 8 {
        return Err(format!("expected 8 fields, got {}", f.len()));
    }
    let side = u8::try_from(integer(f, 2)?).ok().and_then(Side::from_u8).ok_or("bad side")?;
    let order = Order {
        id: integer(f, 0)?,
        trader: address(f, 1)?,
        side,
        ticker: ticker(f, 3)?,
        amount: to_decimal(uint(f, 4)?).ok_or("amount out of range")?,
        filled: to_decimal(uint(f, 5)?).ok_or("filled out of range")?,
        price: integer(f, 6)?,
        timestamp: to_timestamp(uint(f, 7)?).ok_or("date out of range")?,
    };
    if order.filled > order.amount {
        return Err(format!("order {} filled {} exceeds amount {}", order.id, order.filled, order.amount));
    }
    Ok(order)
}

fn uint(fields: &[Token], idx: usize) -> Result<U256, String> {
    match fields.get(idx) {
        Some(Token::Uint(value)) => Ok(*value),
        other => Err(format!("field {idx}: expected uint, got {other:?}")),
    }
}

fn integer(fields: &[Token], idx: usize) -> Result<u64, String> {
    to_integer(uint(fields, idx)?).ok_or_else(|| format!("field {idx}: integer out of range"))
}

fn address(fields: &[Token], idx: usize) -> Result<Address, String> {
    match fields.get(idx) {
        Some(Token::Address(value)) => Ok(*value),
        other => Err(format!("field {idx}: expected address, got {other:?}")),
    }
}

fn ticker(fields: &[Token], idx: usize) -> Result<String, String> {
    match fields.get(idx) {
        Some(Token::FixedBytes(raw)) => {
            bytes32_to_ticker(raw).ok_or_else(|| format!("field {idx}: undecodable ticker"))
        }
        other => Err(format!("field {idx}: expected bytes32, got {other:?}")),
    }
}
