use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::{Abi, Event, RawLog, Token};
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};
use crate::ledger::abi::{dex_abi, erc20_abi};
use crate::ledger::{
    EventFilter, EventKind, LedgerClient, LedgerPush, PointQuery, PointValue, PushCallback,
    RawEvent, SubscriptionHandle,
};
use crate::models::units::ticker_to_bytes32;
use crate::models::LedgerPosition;

struct ActiveSubscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// JSON-RPC backed ledger. Push subscriptions are served by polling log filters, so a
/// plain HTTP endpoint is enough.
pub struct EthersLedgerClient {
    provider: Arc<Provider<Http>>,
    dex_address: Address,
    tokens: BTreeMap<String, Address>,
    dex_abi: Abi,
    erc20_abi: Abi,
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<u64, ActiveSubscription>>,
}

impl EthersLedgerClient {
    pub fn new(
        rpc_url: &str,
        poll_interval: Duration,
        dex_address: Address,
        tokens: BTreeMap<String, Address>,
    ) -> SyncResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| SyncError::Config(format!("rpc url {rpc_url}: {e}")))?
            .interval(poll_interval);
        Ok(Self {
            provider: Arc::new(provider),
            dex_address,
            tokens,
            dex_abi: dex_abi()?,
            erc20_abi: erc20_abi()?,
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    pub fn provider(&self) -> Arc<Provider<Http>> {
        self.provider.clone()
    }

    fn token_address(&self, symbol: &str) -> SyncResult<Address> {
        self.tokens
            .get(symbol)
            .copied()
            .ok_or_else(|| SyncError::Config(format!("unknown token {symbol}")))
    }

    fn log_filter(&self, filter: &EventFilter) -> SyncResult<(Filter, Event)> {
        match filter.kind {
            EventKind::NewTrade => {
                let event = self.dex_abi.event("NewTrade").map_err(SyncError::transport)?.clone();
                let ticker = ticker_to_bytes32(&filter.symbol)
                    .ok_or_else(|| SyncError::Config(format!("bad ticker {}", filter.symbol)))?;
                let log_filter = Filter::new()
                    .address(self.dex_address)
                    .topic0(event.signature())
                    .topic1(H256::from(ticker));
                Ok((log_filter, event))
            }
            EventKind::Transfer => {
                let token = self.token_address(&filter.symbol)?;
                let event = self.erc20_abi.event("Transfer").map_err(SyncError::transport)?.clone();
                let log_filter = Filter::new().address(token).topic0(event.signature());
                Ok((log_filter, event))
            }
        }
    }

    async fn call(
        &self,
        to: Address,
        abi: &Abi,
        name: &str,
        args: &[Token],
    ) -> SyncResult<PointValue> {
        let function = abi.function(name).map_err(SyncError::transport)?;
        let data = function.encode_input(args).map_err(SyncError::transport)?;
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        let out = self.provider.call(&tx, None).await.map_err(SyncError::transport)?;
        function.decode_output(&out).map_err(|e| SyncError::MalformedEvent(format!("{name}: {e}")))
    }
}

fn ticker_token(ticker: &str) -> SyncResult<Token> {
    ticker_to_bytes32(ticker)
        .map(|raw| Token::FixedBytes(raw.to_vec()))
        .ok_or_else(|| SyncError::Config(format!("bad ticker {ticker}")))
}

fn decode_log(event: &Event, kind: EventKind, log: &Log) -> SyncResult<RawEvent> {
    let parsed = event
        .parse_log(RawLog { topics: log.topics.clone(), data: log.data.to_vec() })
        .map_err(|e| SyncError::MalformedEvent(e.to_string()))?;
    let position = LedgerPosition::new(
        log.block_number.map(|b| b.as_u64()).unwrap_or_default(),
        log.log_index.map(|i| i.low_u64()).unwrap_or_default(),
    );
    Ok(RawEvent {
        kind,
        address: log.address,
        position,
        fields: parsed.params.into_iter().map(|p| p.value).collect(),
    })
}

#[async_trait]
impl LedgerClient for EthersLedgerClient {
    async fn point_read(&self, query: &PointQuery) -> SyncResult<PointValue> {
        match query {
            PointQuery::Tokens => self.call(self.dex_address, &self.dex_abi, "getTokens", &[]).await,
            PointQuery::Orders { ticker, side } => {
                let args = [ticker_token(ticker)?, Token::Uint(U256::from(side.as_u8()))];
                self.call(self.dex_address, &self.dex_abi, "getOrders", &args).await
            }
            PointQuery::WalletBalance { account, token } => {
                let token_address = self.token_address(token)?;
                let args = [Token::Address(*account)];
                self.call(token_address, &self.erc20_abi, "balanceOf", &args).await
            }
            PointQuery::ExchangeBalance { account, token } => {
                let args = [Token::Address(*account), ticker_token(token)?];
                self.call(self.dex_address, &self.dex_abi, "traderBalances", &args).await
            }
        }
    }

    async fn range_query(
        &self,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> SyncResult<Vec<RawEvent>> {
        let (log_filter, event) = self.log_filter(filter)?;
        let log_filter = log_filter.from_block(from_block).to_block(to_block);
        let logs = self.provider.get_logs(&log_filter).await.map_err(SyncError::transport)?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_log(&event, filter.kind, log) {
                Ok(raw) => events.push(raw),
                Err(e) => log::warn!("dropping undecodable {filter} log: {e}"),
            }
        }
        Ok(events)
    }

    async fn subscribe(
        &self,
        filter: &EventFilter,
        callback: PushCallback,
    ) -> SyncResult<SubscriptionHandle> {
        let (log_filter, event) = self.log_filter(filter)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let provider = self.provider.clone();
        let kind = filter.kind;
        let label = filter.to_string();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut stream = match provider.watch(&log_filter).await {
                Ok(stream) => stream,
                Err(e) => {
                    callback(LedgerPush::Lost(e.to_string()));
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(log) => match decode_log(&event, kind, &log) {
                            Ok(raw) => callback(LedgerPush::Event(raw)),
                            Err(e) => log::warn!("dropping undecodable {label} log: {e}"),
                        },
                        None => {
                            callback(LedgerPush::Lost(format!("{label} filter stream ended")));
                            break;
                        }
                    }
                }
            }
        });

        self.subscriptions.lock().insert(id, ActiveSubscription { cancel, task });
        log::debug!("subscribed {filter} as #{id}");
        Ok(SubscriptionHandle { id, filter: filter.clone() })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> SyncResult<()> {
        let active = self.subscriptions.lock().remove(&handle.id);
        if let Some(active) = active {
            active.cancel.cancel();
            // the callback can't fire once the polling task has finished
            if let Err(e) = active.task.await {
                log::warn!("subscription #{} task ended abnormally: {e}", handle.id);
            }
            log::debug!("unsubscribed {} #{}", handle.filter, handle.id);
        }
        Ok(())
    }

    async fn current_block_height(&self) -> SyncResult<u64> {
        let height = self.provider.get_block_number().await.map_err(SyncError::transport)?;
        Ok(height.as_u64())
    }
}
