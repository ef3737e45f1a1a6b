//! State-synchronization engine
//!
//! Ledger reads, history backfill and live pushes all end up as [`store::Action`]s on one
//! [`store::StateStore`]; the [`reconciler::Reconciler`] decides when each of them runs.

pub mod backfill;
pub mod coalesce;
pub mod live;
pub mod normalizer;
pub mod reconciler;
pub mod store;
pub mod views;

pub use backfill::{plan_windows, BackfillRun, BlockWindow, HistoryBackfiller, WindowBatch};
pub use live::LiveSubscriber;
pub use normalizer::EventNormalizer;
pub use reconciler::Reconciler;
pub use store::{
    apply, Action, CacheState, ConnectionStatus, HistoryStatus, ListenerGuard, LiveStatus, StateStore,
};
pub use views::PricePoint;
