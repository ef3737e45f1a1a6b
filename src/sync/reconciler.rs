//! Context orchestration
//!
//! A context is the pair (selected ticker, connected account). Entering one bumps the
//! epoch, cancels the previous context's task, tears its live subscriptions down and only
//! then starts the new task. Everything a context produces reaches the store tagged with
//! its epoch, so late results of a cancelled context are dropped by the reducer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, H256};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configure::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::ledger::{EventFilter, LedgerClient, LedgerWriter, OrderIntent, PointQuery, PointValue, RawEvent};
use crate::models::{DomainRecord, Side, StatusLevel, StatusMessage, TokenInfo};
use crate::sync::backfill::HistoryBackfiller;
use crate::sync::coalesce::RefreshCoalescer;
use crate::sync::live::{EventHandler, LiveSubscriber};
use crate::sync::normalizer::EventNormalizer;
use crate::sync::store::{Action, LiveStatus, StateStore};

struct ContextTask {
    epoch: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Reconciler {
    config: SyncConfig,
    ledger: Arc<dyn LedgerClient>,
    writer: Option<Arc<dyn LedgerWriter>>,
    store: Arc<StateStore>,
    normalizer: Arc<EventNormalizer>,
    backfiller: HistoryBackfiller,
    live: Arc<LiveSubscriber>,
    epoch: AtomicU64,
    /// Serializes context switches
    switch_lock: tokio::sync::Mutex<()>,
    context: Mutex<Option<ContextTask>>,
    balance_refresh: RefreshCoalescer,
    market_refresh: RefreshCoalescer,
}

impl Reconciler {
    pub fn new(
        config: SyncConfig,
        ledger: Arc<dyn LedgerClient>,
        writer: Option<Arc<dyn LedgerWriter>>,
        store: Arc<StateStore>,
    ) -> Arc<Self> {
        let normalizer = Arc::new(EventNormalizer::new(config.dex_address, &config.tokens));
        let backfiller = HistoryBackfiller::new(
            ledger.clone(),
            normalizer.clone(),
            config.backfill_window,
            config.retry.clone(),
        );

        let status_store = store.clone();
        let live = LiveSubscriber::new(
            ledger.clone(),
            config.retry.clone(),
            Arc::new(move |status: LiveStatus| {
                if let LiveStatus::Degraded(reason) = &status {
                    status_store.dispatch(Action::PostStatus(StatusMessage::new(
                        format!("Live data degraded: {reason}"),
                        StatusLevel::Warning,
                    )));
                }
                status_store.dispatch(Action::SetLiveStatus(status));
            }),
        );

        let coalesce = Duration::from_millis(config.refresh_coalesce_ms);
        let epoch = store.epoch();
        Arc::new(Self {
            config,
            ledger,
            writer,
            store,
            normalizer,
            backfiller,
            live,
            epoch: AtomicU64::new(epoch),
            switch_lock: tokio::sync::Mutex::new(()),
            context: Mutex::new(None),
            balance_refresh: RefreshCoalescer::new("balance", coalesce),
            market_refresh: RefreshCoalescer::new("market", coalesce),
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn active_filters(&self) -> Vec<EventFilter> {
        self.live.active_filters()
    }

    /// Loads the token registry and enters the restored ticker's context
    pub async fn start(self: &Arc<Self>) {
        let tokens = match self.read_point(&PointQuery::Tokens).await {
            Ok(value) => self.normalizer.normalize_tokens(&value),
            Err(e) => {
                log::warn!("token registry unavailable, using configured tokens: {e}");
                Vec::new()
            }
        };
        let tokens = if tokens.is_empty() {
            self.config
                .tokens
                .iter()
                .map(|(symbol, address)| TokenInfo { symbol: symbol.clone(), address: *address })
                .collect()
        } else {
            tokens
        };
        log::info!("{} tokens registered", tokens.len());
        self.store.dispatch(Action::UpdateTokens(tokens));

        let selected = self.store.read(|s| s.selected_ticker.clone());
        if !self.is_known_token(&selected) {
            log::warn!("restored ticker {selected} is not listed, falling back to {}", self.config.quote_symbol);
            self.store.select_ticker(&self.config.quote_symbol);
        }
        self.enter().await;
    }

    pub async fn connect(self: &Arc<Self>, account: Address, chain_id: u64) {
        self.store.dispatch(Action::Connecting);
        if chain_id != self.config.chain_id {
            log::warn!("wallet on chain {chain_id}, contracts live on {}", self.config.chain_id);
            self.store.dispatch(Action::PostStatus(StatusMessage::new(
                format!("Wrong network: connected to chain {chain_id}, expected {}", self.config.chain_id),
                StatusLevel::Warning,
            )));
        }
        self.store.dispatch(Action::Connected { account, chain_id });
        log::info!("account {account:?} connected");
        self.enter().await;
    }

    pub async fn disconnect(self: &Arc<Self>) {
        self.store.dispatch(Action::ResetAccount);
        log::info!("account disconnected");
        self.enter().await;
    }

    pub async fn select_ticker(self: &Arc<Self>, ticker: &str) -> SyncResult<()> {
        let ticker = ticker.to_uppercase();
        if !self.is_known_token(&ticker) {
            return Err(SyncError::Config(format!("unknown ticker {ticker}")));
        }
        self.store.select_ticker(&ticker);
        log::info!("selected {ticker}");
        self.enter().await;
        Ok(())
    }

    /// Re-reads orders and balances of the current context. History is not rescanned.
    pub async fn refresh(self: &Arc<Self>) {
        let epoch = self.current_epoch();
        self.store.dispatch(Action::Refresh);
        let (ticker, quote_selected) = self.store.read(|s| (s.selected_ticker.clone(), s.is_quote_selected()));
        if !quote_selected {
            self.refresh_orders(epoch, &ticker).await;
        }
        self.refresh_balances(epoch).await;
    }

    /// Hands `intent` to the ledger. The outcome shows up through the normal channels.
    pub async fn submit(&self, intent: &OrderIntent) -> SyncResult<H256> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| SyncError::Config("no signing key configured".into()))?;
        match writer.submit(intent).await {
            Ok(hash) => {
                self.store.dispatch(Action::PostStatus(StatusMessage::new(
                    intent.submitted_text(),
                    StatusLevel::Info,
                )));
                Ok(hash)
            }
            Err(e) => {
                log::error!("submit {intent} failed: {e}");
                self.store.dispatch(Action::PostStatus(StatusMessage::new(
                    format!("Transaction failed: {e}"),
                    StatusLevel::Error,
                )));
                Err(e)
            }
        }
    }

    /// Cancels the running context and releases every subscription
    pub async fn shutdown(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.store.dispatch(Action::AdvanceEpoch(epoch));
        let _guard = self.switch_lock.lock().await;
        self.leave().await;
        log::info!("reconciler stopped");
    }

    fn is_known_token(&self, symbol: &str) -> bool {
        self.config.tokens.contains_key(symbol)
            || self.store.read(|s| s.tokens.iter().any(|t| t.symbol == symbol))
    }

    async fn enter(self: &Arc<Self>) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.store.dispatch(Action::AdvanceEpoch(epoch));

        let _guard = self.switch_lock.lock().await;
        self.leave().await;
        if self.current_epoch() != epoch {
            log::debug!("context {epoch} superseded before start");
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let this = self.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => log::debug!("context {epoch} cancelled"),
                _ = this.run_context(epoch) => log::debug!("context {epoch} settled"),
            }
        });
        *self.context.lock() = Some(ContextTask { epoch, cancel, task });
    }

    async fn leave(&self) {
        let previous = self.context.lock().take();
        if let Some(ctx) = previous {
            ctx.cancel.cancel();
            if let Err(e) = ctx.task.await {
                log::warn!("context {} ended abnormally: {e}", ctx.epoch);
            }
        }
        self.live.teardown().await;
    }

    async fn run_context(self: &Arc<Self>, epoch: u64) {
        let (ticker, account, quote_selected) =
            self.store.read(|s| (s.selected_ticker.clone(), s.account, s.is_quote_selected()));
        log::info!("context {epoch}: ticker {ticker}, account {account:?}");

        // subscribe before reading so nothing falls between the snapshot and the stream
        let mut live_ok = true;
        if !quote_selected {
            live_ok &= self.watch(epoch, EventFilter::new_trades(&ticker)).await;
        }
        if account.is_some() {
            for token in self.config.tokens.keys() {
                live_ok &= self.watch(epoch, EventFilter::transfers(token)).await;
            }
        }
        if live_ok {
            self.store.dispatch(Action::tagged(epoch, Action::SetLiveStatus(LiveStatus::Healthy)));
        }

        self.refresh_balances(epoch).await;
        if !quote_selected {
            self.refresh_orders(epoch, &ticker).await;
            self.run_backfill(epoch, &ticker).await;
        }
    }

    async fn watch(self: &Arc<Self>, epoch: u64, filter: EventFilter) -> bool {
        let weak = Arc::downgrade(self);
        let handler: EventHandler = Arc::new(move |raw: RawEvent| {
            if let Some(this) = weak.upgrade() {
                this.on_live_event(epoch, raw);
            }
        });
        let Err(e) = self.live.subscribe(filter.clone(), handler).await else {
            return true;
        };
        log::error!("live {filter} unavailable: {e}");
        self.store.dispatch(Action::tagged(
            epoch,
            Action::SetLiveStatus(LiveStatus::Degraded(format!("{filter}: {e}"))),
        ));
        self.store.dispatch(Action::tagged(
            epoch,
            Action::PostStatus(StatusMessage::new(format!("Live data degraded: {filter}"), StatusLevel::Warning)),
        ));
        false
    }

    fn on_live_event(self: &Arc<Self>, epoch: u64, raw: RawEvent) {
        if self.current_epoch() != epoch {
            return;
        }
        let account = self.store.read(|s| s.account);
        match self.normalizer.normalize(&raw, account) {
            Some(DomainRecord::Trade(trade)) => {
                let mine = account.is_some_and(|a| trade.involves(a));
                let taker = account == Some(trade.trader2);
                let trade_id = trade.trade_id;
                // A trade the backfill already merged still moves balances and the book
                if !self.store.dispatch(Action::tagged(epoch, Action::InsertTrades(vec![trade]))) {
                    log::debug!("live trade {trade_id} already known");
                }
                if taker {
                    self.store.dispatch(Action::tagged(
                        epoch,
                        Action::PostStatus(StatusMessage::new("Market Order Filled", StatusLevel::Success)),
                    ));
                }
                self.schedule_market_refresh();
                if mine {
                    self.schedule_balance_refresh();
                }
            }
            Some(DomainRecord::Transfer(notice)) => {
                log::info!("{} of {} observed", notice.direction, notice.token);
                self.store.dispatch(Action::tagged(epoch, Action::TransferObserved(notice)));
                self.schedule_balance_refresh();
            }
            _ => {}
        }
    }

    fn schedule_balance_refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.balance_refresh.trigger(move || async move {
            if let Some(this) = weak.upgrade() {
                let epoch = this.current_epoch();
                this.refresh_balances(epoch).await;
            }
        });
    }

    fn schedule_market_refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.market_refresh.trigger(move || async move {
            if let Some(this) = weak.upgrade() {
                let epoch = this.current_epoch();
                let (ticker, quote_selected) =
                    this.store.read(|s| (s.selected_ticker.clone(), s.is_quote_selected()));
                if !quote_selected {
                    this.refresh_orders(epoch, &ticker).await;
                }
            }
        });
    }

    async fn read_point(&self, query: &PointQuery) -> SyncResult<PointValue> {
        let ledger = &self.ledger;
        self.config
            .retry
            .retry_async(&format!("{query:?}"), |_| ledger.point_read(query))
            .await
    }

    /// Selected ticker and quote asset, each read once
    async fn refresh_balances(&self, epoch: u64) {
        let (account, quote_selected, mut tokens) = self.store.read(|s| {
            (s.account, s.is_quote_selected(), vec![s.selected_ticker.clone(), s.quote_symbol.clone()])
        });
        let Some(account) = account else {
            return;
        };
        if quote_selected {
            tokens.pop();
        }
        for token in tokens {
            let wallet = self
                .read_point(&PointQuery::WalletBalance { account, token: token.clone() })
                .await;
            let exchange = self
                .read_point(&PointQuery::ExchangeBalance { account, token: token.clone() })
                .await;
            match (wallet, exchange) {
                (Ok(wallet), Ok(exchange)) => {
                    if let Some(snapshot) = self.normalizer.normalize_balance(account, &token, &wallet, &exchange) {
                        self.store.dispatch(Action::tagged(epoch, Action::UpdateBalance(snapshot)));
                    }
                }
                (Err(e), _) | (_, Err(e)) => log::warn!("{token} balance refresh failed: {e}"),
            }
        }
    }

    /// Both sides or nothing; a one-sided snapshot would mark the other side filled
    async fn refresh_orders(&self, epoch: u64, ticker: &str) {
        let mut orders = Vec::new();
        for side in [Side::Buy, Side::Sell] {
            match self.read_point(&PointQuery::Orders { ticker: ticker.to_string(), side }).await {
                Ok(value) => orders.extend(self.normalizer.normalize_orders(&value)),
                Err(e) => {
                    log::warn!("{ticker} {side:?} orders refresh failed: {e}");
                    return;
                }
            }
        }
        self.store.dispatch(Action::tagged(
            epoch,
            Action::ReplaceOrders { ticker: ticker.to_string(), orders },
        ));
    }

    async fn run_backfill(&self, epoch: u64, ticker: &str) {
        self.store.dispatch(Action::tagged(epoch, Action::BeginBackfill));
        let mut run = match self.backfiller.begin(ticker, self.config.start_block).await {
            Ok(run) => run,
            Err(e) => return self.backfill_failed(epoch, e),
        };

        let mut merged = 0;
        while let Some(batch) = run.next_batch().await {
            match batch {
                Ok(batch) => {
                    merged += batch.trades.len();
                    if !batch.trades.is_empty() {
                        self.store.dispatch(Action::tagged(epoch, Action::InsertTrades(batch.trades)));
                    }
                }
                Err(e) => return self.backfill_failed(epoch, e),
            }
        }
        self.store.dispatch(Action::tagged(epoch, Action::BackfillComplete));
        log::info!("backfill {ticker}: {merged} trades over {} windows", run.windows().len());
    }

    fn backfill_failed(&self, epoch: u64, err: SyncError) {
        log::error!("{err}");
        self.store.dispatch(Action::tagged(epoch, Action::BackfillFailed(err.to_string())));
        self.store.dispatch(Action::tagged(
            epoch,
            Action::PostStatus(StatusMessage::new(
                "Trade history incomplete, showing what was loaded",
                StatusLevel::Warning,
            )),
        ));
    }
}
