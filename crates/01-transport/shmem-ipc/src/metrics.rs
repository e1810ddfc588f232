use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Events counted by an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IpcEvent {
    Submitted,
    Rejected,
    Published,
    Reclaimed,
    Doorbell,
    Delivered,
    Probe,
    Dropped,
}

#[derive(Debug, Default)]
pub struct IpcMetrics {
    submitted: AtomicU64,
    rejected: AtomicU64,
    published: AtomicU64,
    reclaimed: AtomicU64,
    doorbells: AtomicU64,
    delivered: AtomicU64,
    probes: AtomicU64,
    dropped: AtomicU64,
}

impl IpcMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, event: IpcEvent) {
        self.record_n(event, 1);
    }

    pub(crate) fn record_n(&self, event: IpcEvent, n: u64) {
        let counter = match event {
            IpcEvent::Submitted => &self.submitted,
            IpcEvent::Rejected => &self.rejected,
            IpcEvent::Published => &self.published,
            IpcEvent::Reclaimed => &self.reclaimed,
            IpcEvent::Doorbell => &self.doorbells,
            IpcEvent::Delivered => &self.delivered,
            IpcEvent::Probe => &self.probes,
            IpcEvent::Dropped => &self.dropped,
        };
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IpcMetricsSnapshot {
        IpcMetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            doorbells: self.doorbells.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            unknown_address: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IpcMetricsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub published: u64,
    pub reclaimed: u64,
    pub doorbells: u64,
    pub delivered: u64,
    pub probes: u64,
    pub dropped: u64,
    /// Descriptors addressed to an empty client slot; kept by the registry.
    pub unknown_address: u64,
}
