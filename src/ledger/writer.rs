//! Write-capable half of the ledger handle
//!
//! Intents are only submitted; whatever they change on the ledger comes back through the
//! normal read/subscription channels.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use ethers::abi::{Abi, Token};
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use rust_decimal::Decimal;

use crate::error::{SyncError, SyncResult};
use crate::ledger::abi::{dex_abi, erc20_abi};
use crate::models::units::{from_decimal, ticker_to_bytes32};
use crate::models::Side;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderIntent {
    Limit { ticker: String, amount: Decimal, price: u64, side: Side },
    Market { ticker: String, amount: Decimal, side: Side },
    Deposit { token: String, amount: Decimal },
    Withdraw { token: String, amount: Decimal },
}

impl OrderIntent {
    pub fn amount(&self) -> Decimal {
        match self {
            OrderIntent::Limit { amount, .. }
            | OrderIntent::Market { amount, .. }
            | OrderIntent::Deposit { amount, .. }
            | OrderIntent::Withdraw { amount, .. } => *amount,
        }
    }

    /// Status text shown once the ledger accepted the transaction
    pub fn submitted_text(&self) -> &'static str {
        match self {
            OrderIntent::Limit { .. } | OrderIntent::Market { .. } => {
                "New Order Submitted to Blockchain"
            }
            OrderIntent::Deposit { .. } => "Deposit Request Submitted to Blockchain",
            OrderIntent::Withdraw { .. } => "Withdraw Request Submitted to Blockchain",
        }
    }

    /// Rejects intents the ledger could never accept
    pub fn validate(&self) -> SyncResult<()> {
        if self.amount() <= Decimal::ZERO {
            return Err(SyncError::Config(format!("invalid amount {}", self.amount())));
        }
        if let OrderIntent::Limit { price: 0, .. } = self {
            return Err(SyncError::Config("limit order needs a price".into()));
        }
        Ok(())
    }
}

impl fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderIntent::Limit { ticker, amount, price, side } => {
                write!(f, "limit {side:?} {amount} {ticker} @ {price}")
            }
            OrderIntent::Market { ticker, amount, side } => {
                write!(f, "market {side:?} {amount} {ticker}")
            }
            OrderIntent::Deposit { token, amount } => write!(f, "deposit {amount} {token}"),
            OrderIntent::Withdraw { token, amount } => write!(f, "withdraw {amount} {token}"),
        }
    }
}

#[async_trait]
pub trait LedgerWriter: Send + Sync {
    /// Returns the transaction hash once the ledger accepted the transaction
    async fn submit(&self, intent: &OrderIntent) -> SyncResult<H256>;
}

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

pub struct EthersLedgerWriter {
    client: SignerClient,
    dex_address: Address,
    tokens: BTreeMap<String, Address>,
    dex_abi: Abi,
    erc20_abi: Abi,
}

impl EthersLedgerWriter {
    pub fn new(
        provider: Provider<Http>,
        private_key: &str,
        chain_id: u64,
        dex_address: Address,
        tokens: BTreeMap<String, Address>,
    ) -> SyncResult<Self> {
        let wallet = LocalWallet::from_str(private_key)
            .map_err(|e| SyncError::Config(format!("private key: {e}")))?
            .with_chain_id(chain_id);
        Ok(Self {
            client: SignerMiddleware::new(provider, wallet),
            dex_address,
            tokens,
            dex_abi: dex_abi()?,
            erc20_abi: erc20_abi()?,
        })
    }

    pub fn address(&self) -> Address {
        self.client.address()
    }

    fn encode(abi: &Abi, name: &str, args: &[Token]) -> SyncResult<Vec<u8>> {
        let function = abi.function(name).map_err(SyncError::transport)?;
        function.encode_input(args).map_err(SyncError::transport)
    }

    async fn send(&self, to: Address, data: Vec<u8>) -> SyncResult<H256> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        let pending = self.client.send_transaction(tx, None).await.map_err(SyncError::transport)?;
        Ok(pending.tx_hash())
    }

    /// Deposits need the exchange to be allowed to pull the tokens first
    async fn ensure_allowance(&self, token: Address, amount: U256) -> SyncResult<()> {
        let owner = self.client.address();
        let data =
            Self::encode(&self.erc20_abi, "allowance", &[Token::Address(owner), Token::Address(self.dex_address)])?;
        let tx: TypedTransaction = TransactionRequest::new().to(token).data(data).into();
        let out = self.client.call(&tx, None).await.map_err(SyncError::transport)?;
        let allowance = self
            .erc20_abi
            .function("allowance")
            .map_err(SyncError::transport)?
            .decode_output(&out)
            .ok()
            .and_then(|tokens| tokens.into_iter().next())
            .and_then(|token| token.into_uint())
            .unwrap_or_default();
        if allowance >= amount {
            return Ok(());
        }

        log::info!("approving exchange {:?} to spend token {:?}", self.dex_address, token);
        let data = Self::encode(&self.erc20_abi, "approve", &[Token::Address(self.dex_address), Token::Uint(U256::MAX)])?;
        let tx: TypedTransaction = TransactionRequest::new().to(token).data(data).into();
        let pending = self.client.send_transaction(tx, None).await.map_err(SyncError::transport)?;
        pending.await.map_err(SyncError::transport)?;
        Ok(())
    }
}

fn ticker_arg(ticker: &str) -> SyncResult<Token> {
    ticker_to_bytes32(ticker)
        .map(|raw| Token::FixedBytes(raw.to_vec()))
        .ok_or_else(|| SyncError::Config(format!("bad ticker {ticker}")))
}

fn amount_arg(amount: Decimal) -> SyncResult<U256> {
    from_decimal(amount).ok_or_else(|| SyncError::Config(format!("amount {amount} out of range")))
}

#[async_trait]
impl LedgerWriter for EthersLedgerWriter {
    async fn submit(&self, intent: &OrderIntent) -> SyncResult<H256> {
        intent.validate()?;
        let amount = amount_arg(intent.amount())?;
        let data = match intent {
            OrderIntent::Limit { ticker, price, side, .. } => Self::encode(
                &self.dex_abi,
                "createLimitOrder",
                &[
                    ticker_arg(ticker)?,
                    Token::Uint(amount),
                    Token::Uint(U256::from(*price)),
                    Token::Uint(U256::from(side.as_u8())),
                ],
            )?,
            OrderIntent::Market { ticker, side, .. } => Self::encode(
                &self.dex_abi,
                "createMarketOrder",
                &[ticker_arg(ticker)?, Token::Uint(amount), Token::Uint(U256::from(side.as_u8()))],
            )?,
            OrderIntent::Deposit { token, .. } => {
                let token_address = self
                    .tokens
                    .get(token)
                    .copied()
                    .ok_or_else(|| SyncError::Config(format!("unknown token {token}")))?;
                self.ensure_allowance(token_address, amount).await?;
                Self::encode(&self.dex_abi, "deposit", &[Token::Uint(amount), ticker_arg(token)?])?
            }
            OrderIntent::Withdraw { token, .. } => {
                Self::encode(&self.dex_abi, "withdraw", &[Token::Uint(amount), ticker_arg(token)?])?
            }
        };

        let hash = self.send(self.dex_address, data).await?;
        log::info!("submitted {intent}: tx {hash:?}");
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_zero_amount_and_price() {
        let zero = OrderIntent::Deposit { token: "DAI".into(), amount: Decimal::ZERO };
        assert!(zero.validate().is_err());

        let no_price = OrderIntent::Limit {
            ticker: "BAT".into(),
            amount: Decimal::ONE,
            price: 0,
            side: Side::Buy,
        };
        assert!(no_price.validate().is_err());

        let market = OrderIntent::Market { ticker: "BAT".into(), amount: Decimal::ONE, side: Side::Sell };
        assert!(market.validate().is_ok());
        assert_eq!(market.submitted_text(), "New Order Submitted to Blockchain");
    }
}
