//! Live push subscriptions
//!
//! One registration per [`EventFilter`]. Registering the same filter again replaces the
//! previous registration. A lost push channel is reopened in the background with the
//! retry policy; the outcome is reported through the status handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::ledger::{EventFilter, LedgerClient, LedgerPush, PushCallback, RawEvent, SubscriptionHandle};
use crate::retry::RetryPolicy;
use crate::sync::store::LiveStatus;

pub type EventHandler = Arc<dyn Fn(RawEvent) + Send + Sync>;
pub type StatusHandler = Arc<dyn Fn(LiveStatus) + Send + Sync>;

struct Registration {
    /// `None` while (re)opening
    handle: Option<SubscriptionHandle>,
    on_event: EventHandler,
    generation: u64,
}

pub struct LiveSubscriber {
    ledger: Arc<dyn LedgerClient>,
    retry: RetryPolicy,
    on_status: StatusHandler,
    next_generation: AtomicU64,
    active: Mutex<HashMap<EventFilter, Registration>>,
}

impl LiveSubscriber {
    pub fn new(ledger: Arc<dyn LedgerClient>, retry: RetryPolicy, on_status: StatusHandler) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            retry,
            on_status,
            next_generation: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// `on_event` runs once per delivered event until the filter is unsubscribed
    pub async fn subscribe(self: &Arc<Self>, filter: EventFilter, on_event: EventHandler) -> SyncResult<()> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let previous = self
            .active
            .lock()
            .insert(filter.clone(), Registration { handle: None, on_event, generation });
        if let Some(handle) = previous.and_then(|r| r.handle) {
            self.release(&handle).await;
        }

        match self.open(&filter, generation).await {
            Ok(handle) => {
                if let Some(stale) = self.attach(&filter, generation, handle) {
                    self.release(&stale).await;
                }
                log::debug!("live {filter} registered");
                Ok(())
            }
            Err(e) => {
                let mut active = self.active.lock();
                if active.get(&filter).is_some_and(|r| r.generation == generation) {
                    active.remove(&filter);
                }
                Err(e)
            }
        }
    }

    /// Returns once the ledger guarantees no more callbacks for `filter`
    pub async fn unsubscribe(&self, filter: &EventFilter) {
        let removed = self.active.lock().remove(filter);
        if let Some(handle) = removed.and_then(|r| r.handle) {
            self.release(&handle).await;
        }
    }

    /// Unsubscribes everything
    pub async fn teardown(&self) {
        for filter in self.active_filters() {
            self.unsubscribe(&filter).await;
        }
    }

    pub fn active_filters(&self) -> Vec<EventFilter> {
        self.active.lock().keys().cloned().collect()
    }

    async fn open(self: &Arc<Self>, filter: &EventFilter, generation: u64) -> SyncResult<SubscriptionHandle> {
        let weak = Arc::downgrade(self);
        let key = filter.clone();
        let callback: PushCallback = Arc::new(move |push| {
            if let Some(this) = weak.upgrade() {
                this.on_push(&key, generation, push);
            }
        });
        let ledger = &self.ledger;
        self.retry
            .retry_async(&format!("subscribe {filter}"), |_| ledger.subscribe(filter, callback.clone()))
            .await
    }

    /// Stores `handle` on the registration, or hands it back if the registration is gone
    fn attach(&self, filter: &EventFilter, generation: u64, handle: SubscriptionHandle) -> Option<SubscriptionHandle> {
        let mut active = self.active.lock();
        match active.get_mut(filter) {
            Some(reg) if reg.generation == generation => {
                reg.handle = Some(handle);
                None
            }
            _ => Some(handle),
        }
    }

    async fn release(&self, handle: &SubscriptionHandle) {
        if let Err(e) = self.ledger.unsubscribe(handle).await {
            log::warn!("unsubscribe {} #{} failed: {e}", handle.filter, handle.id);
        }
    }

    fn on_push(self: &Arc<Self>, filter: &EventFilter, generation: u64, push: LedgerPush) {
        match push {
            LedgerPush::Event(raw) => {
                let handler = self
                    .active
                    .lock()
                    .get(filter)
                    .filter(|r| r.generation == generation)
                    .map(|r| r.on_event.clone());
                if let Some(handler) = handler {
                    handler(raw);
                }
            }
            LedgerPush::Lost(reason) => {
                let dead = match self.active.lock().get_mut(filter) {
                    Some(reg) if reg.generation == generation => reg.handle.take(),
                    _ => return,
                };
                let lost = SyncError::SubscriptionLost(format!("{filter}: {reason}"));
                log::warn!("live {lost}, resubscribing");
                let this = self.clone();
                let filter = filter.clone();
                tokio::spawn(async move { this.resubscribe(filter, generation, dead, lost).await });
            }
        }
    }

    /// `dead` is the handle of the lost channel; the ledger keeps it allocated until released
    async fn resubscribe(
        self: Arc<Self>,
        filter: EventFilter,
        generation: u64,
        dead: Option<SubscriptionHandle>,
        lost: SyncError,
    ) {
        if let Some(handle) = dead {
            self.release(&handle).await;
        }
        match self.open(&filter, generation).await {
            Ok(handle) => {
                if let Some(stale) = self.attach(&filter, generation, handle) {
                    self.release(&stale).await;
                    return;
                }
                log::info!("live {filter} resubscribed");
                (self.on_status)(LiveStatus::Healthy);
            }
            Err(e) => {
                let current = self.active.lock().get(&filter).is_some_and(|r| r.generation == generation);
                if current {
                    log::error!("live {filter} could not be restored: {e}");
                    (self.on_status)(LiveStatus::Degraded(format!("{lost}; resubscribe failed: {e}")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::mock::{new_trade_event, LedgerCall};
    use crate::ledger::MockLedger;
    use crate::models::LedgerPosition;
    use ethers::types::Address;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Fixture {
        mock: Arc<MockLedger>,
        live: Arc<LiveSubscriber>,
        statuses: Arc<Mutex<Vec<LiveStatus>>>,
    }

    fn fixture() -> Fixture {
        let mut tokens = BTreeMap::new();
        tokens.insert("DAI".to_string(), Address::repeat_byte(1));
        tokens.insert("BAT".to_string(), Address::repeat_byte(2));
        let mock = Arc::new(MockLedger::new(Address::repeat_byte(9), tokens));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        let live = LiveSubscriber::new(
            mock.clone(),
            RetryPolicy::new(2, 1, 1, 0.0),
            Arc::new(move |status| sink.lock().push(status)),
        );
        Fixture { mock, live, statuses }
    }

    fn counter() -> (Arc<AtomicU64>, EventHandler) {
        let seen = Arc::new(AtomicU64::new(0));
        let c = seen.clone();
        (seen, Arc::new(move |_: RawEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn push_trade(mock: &MockLedger, trade_id: u64) {
        let a = Address::repeat_byte(3);
        mock.push_event(new_trade_event(
            mock.dex_address(),
            trade_id,
            1,
            "BAT",
            a,
            a,
            1,
            10,
            0,
            LedgerPosition::new(trade_id, 0),
        ));
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_reregistration_keeps_one_subscription() {
        let f = fixture();
        let (first, on_first) = counter();
        let (second, on_second) = counter();
        f.live.subscribe(EventFilter::new_trades("BAT"), on_first).await.unwrap();
        f.live.subscribe(EventFilter::new_trades("BAT"), on_second).await.unwrap();

        assert_eq!(f.mock.active_subscriptions().len(), 1);
        push_trade(&f.mock, 1);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_stops_delivery() {
        let f = fixture();
        let (seen, on_event) = counter();
        f.live.subscribe(EventFilter::new_trades("BAT"), on_event).await.unwrap();
        f.live.subscribe(EventFilter::transfers("DAI"), Arc::new(|_: RawEvent| {})).await.unwrap();
        f.live.teardown().await;

        assert!(f.mock.active_subscriptions().is_empty());
        assert!(f.live.active_filters().is_empty());
        push_trade(&f.mock, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lost_subscription_is_restored() {
        let f = fixture();
        let (seen, on_event) = counter();
        f.live.subscribe(EventFilter::new_trades("BAT"), on_event).await.unwrap();

        f.mock.drop_subscriptions("connection reset");
        wait_for(|| f.mock.active_subscriptions().len() == 1).await;
        wait_for(|| !f.statuses.lock().is_empty()).await;
        assert_eq!(f.statuses.lock().as_slice(), &[LiveStatus::Healthy]);

        push_trade(&f.mock, 2);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(f.mock.lost_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_losses_release_every_dead_handle() {
        let f = fixture();
        f.live.subscribe(EventFilter::new_trades("BAT"), Arc::new(|_: RawEvent| {})).await.unwrap();

        for round in 1..=3 {
            f.mock.drop_subscriptions("connection reset");
            wait_for(|| f.statuses.lock().len() == round).await;
        }

        assert!(f.mock.lost_subscriptions().is_empty());
        assert_eq!(f.mock.active_subscriptions(), vec![EventFilter::new_trades("BAT")]);
        assert_eq!(f.mock.count_calls(|c| matches!(c, LedgerCall::Unsubscribe(_))), 3);
    }

    #[tokio::test]
    async fn test_failed_resubscribe_reports_degraded() {
        let f = fixture();
        f.live.subscribe(EventFilter::new_trades("BAT"), Arc::new(|_: RawEvent| {})).await.unwrap();

        f.mock.fail_subscribe(5);
        f.mock.drop_subscriptions("connection reset");
        wait_for(|| !f.statuses.lock().is_empty()).await;
        match &f.statuses.lock()[0] {
            LiveStatus::Degraded(reason) => assert!(reason.starts_with("subscription lost: ")),
            other => panic!("expected degraded, got {other:?}"),
        }
        assert!(f.mock.active_subscriptions().is_empty());
        assert!(f.mock.lost_subscriptions().is_empty());
    }
}
