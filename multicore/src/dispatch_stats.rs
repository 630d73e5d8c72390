use std::sync::atomic::{AtomicU64, Ordering};

/// Dispatch-side counters for a [`ChannelDispatcher`](crate::ChannelDispatcher).
#[derive(Default)]
pub struct DispatchStats {
    pub dispatched: AtomicU64,
    pub dropped: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
