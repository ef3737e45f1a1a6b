//! Read helpers derived from the cache on demand

use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use ethers::types::Address;

use crate::models::{BalanceSnapshot, Order, OrderBookView, Side, TokenInfo, Trade};
use crate::sync::store::CacheState;

/// One chart point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: u64,
}

impl CacheState {
    /// Open orders of the selected ticker. Best price first, then oldest.
    pub fn order_book(&self) -> OrderBookView {
        let mut view = OrderBookView::default();
        for order in self.orders.values() {
            if order.ticker != self.selected_ticker || !order.is_open() {
                continue;
            }
            match order.side {
                Side::Buy => view.buy_orders.push(order.clone()),
                Side::Sell => view.sell_orders.push(order.clone()),
            }
        }
        view.buy_orders.sort_by_key(|o| (Reverse(o.price), o.timestamp, o.id));
        view.sell_orders.sort_by_key(|o| (o.price, o.timestamp, o.id));
        view
    }

    /// Open orders `account` placed on the selected ticker
    pub fn my_orders(&self, account: Address) -> Vec<Order> {
        let book = self.order_book();
        book.buy_orders
            .into_iter()
            .chain(book.sell_orders)
            .filter(|o| o.trader == account)
            .collect()
    }

    /// Newest first
    pub fn recent_trades(&self, limit: usize) -> Vec<Trade> {
        self.trades.iter().rev().take(limit).cloned().collect()
    }

    /// Trades `account` took part in, newest first
    pub fn my_trades(&self, account: Address) -> Vec<Trade> {
        self.trades.iter().rev().filter(|t| t.involves(account)).cloned().collect()
    }

    /// Oldest first
    pub fn price_series(&self) -> Vec<PricePoint> {
        self.trades
            .iter()
            .map(|t| PricePoint { timestamp: t.timestamp, price: t.price })
            .collect()
    }

    pub fn last_price(&self) -> Option<u64> {
        self.trades.last().map(|t| t.price)
    }

    pub fn balance(&self, account: Address, token: &str) -> BalanceSnapshot {
        self.balances
            .get(&account)
            .and_then(|per_token| per_token.get(token))
            .cloned()
            .unwrap_or_else(|| BalanceSnapshot::zero(account, token))
    }

    /// Every registered token except the quote asset
    pub fn trading_tokens(&self) -> Vec<TokenInfo> {
        self.tokens.iter().filter(|t| t.symbol != self.quote_symbol).cloned().collect()
    }

    pub fn is_quote_selected(&self) -> bool {
        self.selected_ticker == self.quote_symbol
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LedgerPosition;
    use crate::sync::store::{apply, Action};
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn order(id: u64, side: Side, price: u64, secs: i64, filled: i64) -> Order {
        Order {
            id,
            trader: Address::repeat_byte(id as u8),
            ticker: "BAT".into(),
            side,
            amount: Decimal::from(10),
            filled: Decimal::from(filled),
            price,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn trade(trade_id: u64, price: u64, block: u64) -> Trade {
        Trade {
            trade_id,
            order_id: 1,
            ticker: "BAT".into(),
            trader1: Address::repeat_byte(1),
            trader2: Address::repeat_byte(2),
            amount: Decimal::ONE,
            price,
            timestamp: Utc.timestamp_opt(block as i64, 0).unwrap(),
            position: LedgerPosition::new(block, 0),
        }
    }

    #[test]
    fn test_order_book_sorted_and_open_only() {
        let orders = vec![
            order(1, Side::Buy, 10, 5, 0),
            order(2, Side::Buy, 12, 9, 0),
            order(3, Side::Buy, 10, 1, 0),
            order(4, Side::Sell, 15, 1, 0),
            order(5, Side::Sell, 13, 1, 0),
            order(6, Side::Sell, 11, 1, 10),
        ];
        let state = apply(
            CacheState::new("BAT", "DAI"),
            Action::ReplaceOrders { ticker: "BAT".into(), orders },
        );
        let book = state.order_book();
        let buys: Vec<u64> = book.buy_orders.iter().map(|o| o.id).collect();
        let sells: Vec<u64> = book.sell_orders.iter().map(|o| o.id).collect();
        assert_eq!(buys, vec![2, 3, 1]);
        assert_eq!(sells, vec![5, 4]);

        assert_eq!(state.my_orders(Address::repeat_byte(4)).len(), 1);
    }

    #[test]
    fn test_order_book_follows_selected_ticker() {
        let state = apply(
            CacheState::new("REP", "DAI"),
            Action::ReplaceOrders { ticker: "BAT".into(), orders: vec![order(1, Side::Buy, 10, 5, 0)] },
        );
        assert_eq!(state.order_book(), OrderBookView::default());
    }

    #[test]
    fn test_recent_trades_newest_first() {
        let trades = (1..=7).map(|i| trade(i, 10 + i, i * 10)).collect();
        let state = apply(CacheState::new("BAT", "DAI"), Action::InsertTrades(trades));
        let ids: Vec<u64> = state.recent_trades(5).iter().map(|t| t.trade_id).collect();
        assert_eq!(ids, vec![7, 6, 5, 4, 3]);
        assert_eq!(state.price_series().first().map(|p| p.price), Some(11));
        assert_eq!(state.last_price(), Some(17));
        assert_eq!(state.my_trades(Address::repeat_byte(2)).len(), 7);
    }

    #[test]
    fn test_missing_balance_reads_zero_and_quote_excluded() {
        let mut state = CacheState::new("DAI", "DAI");
        state.tokens = vec![
            TokenInfo { symbol: "DAI".into(), address: Address::repeat_byte(1) },
            TokenInfo { symbol: "BAT".into(), address: Address::repeat_byte(2) },
        ];
        let account = Address::repeat_byte(5);
        assert_eq!(state.balance(account, "BAT"), BalanceSnapshot::zero(account, "BAT"));
        assert_eq!(state.trading_tokens().len(), 1);
        assert!(state.is_quote_selected());
    }
}
