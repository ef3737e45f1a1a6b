//! Paginated trade history scan
//!
//! The block range is cut into a window plan once, against the tip observed at start, and
//! walked in increasing block order. A window that still fails after retries ends the run.

use std::sync::Arc;

use crate::error::{SyncError, SyncResult};
use crate::ledger::{EventFilter, LedgerClient};
use crate::models::{DomainRecord, Trade};
use crate::retry::RetryPolicy;
use crate::sync::normalizer::EventNormalizer;

/// Inclusive block range; `from_block > to_block` means empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWindow {
    pub from_block: u64,
    pub to_block: u64,
}

impl BlockWindow {
    pub fn new(from_block: u64, to_block: u64) -> Self {
        Self { from_block, to_block }
    }

    pub fn is_empty(&self) -> bool {
        self.from_block > self.to_block
    }
}

/// Windows with upper bounds `from_block + k * size`, clipped to `tip`. Planning stops at
/// the first bound past the tip, so the last window may be empty.
pub fn plan_windows(from_block: u64, tip: u64, size: u64) -> Vec<BlockWindow> {
    let size = size.max(1);
    let mut windows = Vec::new();
    let mut start = from_block;
    let mut k: u64 = 1;
    loop {
        let bound = from_block.saturating_add(size.saturating_mul(k));
        windows.push(BlockWindow::new(start, bound.min(tip)));
        if bound > tip || bound == u64::MAX {
            break;
        }
        start = bound + 1;
        k += 1;
    }
    windows
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowBatch {
    pub window: BlockWindow,
    /// In ledger order
    pub trades: Vec<Trade>,
}

pub struct HistoryBackfiller {
    ledger: Arc<dyn LedgerClient>,
    normalizer: Arc<EventNormalizer>,
    window_size: u64,
    retry: RetryPolicy,
}

impl HistoryBackfiller {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        normalizer: Arc<EventNormalizer>,
        window_size: u64,
        retry: RetryPolicy,
    ) -> Self {
        Self { ledger, normalizer, window_size, retry }
    }

    /// Lazy scan of `[from_block, tip]`; nothing is queried until the run is polled
    pub fn backfill(&self, ticker: &str, from_block: u64, tip: u64) -> BackfillRun {
        let windows = plan_windows(from_block, tip, self.window_size);
        log::debug!(
            "backfill {ticker}: blocks [{from_block}, {tip}] in {} windows of {}",
            windows.len(),
            self.window_size
        );
        BackfillRun {
            ledger: self.ledger.clone(),
            normalizer: self.normalizer.clone(),
            retry: self.retry.clone(),
            ticker: ticker.to_string(),
            filter: EventFilter::new_trades(ticker),
            windows,
            next: 0,
            failed: false,
        }
    }

    /// Reads the current tip and plans a scan up to it
    pub async fn begin(&self, ticker: &str, from_block: u64) -> SyncResult<BackfillRun> {
        let ledger = &self.ledger;
        let tip = self
            .retry
            .retry_async("block height", |_| ledger.current_block_height())
            .await?;
        Ok(self.backfill(ticker, from_block, tip))
    }
}

pub struct BackfillRun {
    ledger: Arc<dyn LedgerClient>,
    normalizer: Arc<EventNormalizer>,
    retry: RetryPolicy,
    ticker: String,
    filter: EventFilter,
    windows: Vec<BlockWindow>,
    next: usize,
    failed: bool,
}

impl BackfillRun {
    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn windows(&self) -> &[BlockWindow] {
        &self.windows
    }

    pub fn is_finished(&self) -> bool {
        self.failed || self.next >= self.windows.len()
    }

    /// Trades of the next non-empty window. `None` once every window was read or after the
    /// first failure.
    pub async fn next_batch(&mut self) -> Option<SyncResult<WindowBatch>> {
        if self.failed {
            return None;
        }
        while let Some(window) = self.windows.get(self.next).copied() {
            self.next += 1;
            if window.is_empty() {
                continue;
            }

            let ledger = &self.ledger;
            let filter = &self.filter;
            let label = format!("backfill {} [{}, {}]", self.ticker, window.from_block, window.to_block);
            let result = self
                .retry
                .retry_async(&label, |_| ledger.range_query(filter, window.from_block, window.to_block))
                .await;

            return Some(match result {
                Ok(events) => {
                    let mut trades: Vec<Trade> = events
                        .iter()
                        .filter_map(|raw| match self.normalizer.normalize(raw, None) {
                            Some(DomainRecord::Trade(trade)) if trade.ticker == self.ticker => Some(trade),
                            _ => None,
                        })
                        .collect();
                    trades.sort_by_key(|t| t.position);
                    Ok(WindowBatch { window, trades })
                }
                Err(e) => {
                    self.failed = true;
                    Err(SyncError::BackfillFailed {
                        ticker: self.ticker.clone(),
                        from_block: window.from_block,
                        to_block: window.to_block,
                        reason: e.to_string(),
                    })
                }
            });
        }
        None
    }

    /// Starts over from the first window of the same plan
    pub fn restart(&mut self) {
        self.next = 0;
        self.failed = false;
    }

    /// Drains the run; any window failure fails the whole scan
    pub async fn collect(mut self) -> SyncResult<Vec<Trade>> {
        let mut trades = Vec::new();
        while let Some(batch) = self.next_batch().await {
            trades.extend(batch?.trades);
        }
        Ok(trades)
    }
}
