use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Collapses bursts of refresh triggers. With a zero window every trigger runs on its own;
/// otherwise triggers arriving while a run is pending are absorbed by it.
pub struct RefreshCoalescer {
    label: &'static str,
    window: Duration,
    pending: Arc<AtomicBool>,
}

impl RefreshCoalescer {
    pub fn new(label: &'static str, window: Duration) -> Self {
        Self { label, window, pending: Arc::new(AtomicBool::new(false)) }
    }

    /// Returns false when the trigger was absorbed by an already pending run
    pub fn trigger<F, Fut>(&self, make: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.window.is_zero() {
            tokio::spawn(make());
            return true;
        }
        if self.pending.swap(true, Ordering::SeqCst) {
            log::debug!("{} refresh already pending", self.label);
            return false;
        }
        let pending = self.pending.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            pending.store(false, Ordering::SeqCst);
            make().await;
        });
        true
    }
}
