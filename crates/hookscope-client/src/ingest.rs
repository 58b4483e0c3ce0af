//! Fan-out of accepted events to the cache, the durable store and the
//! monitor.

use std::sync::Arc;

use chrono::Utc;
use tracing::trace;

use hookscope_core::HookEvent;

use crate::cache::EventCache;
use crate::monitor::HealthMonitor;
use crate::persistence::PersistenceBridge;

/// Sink for events coming off a subscription.
pub struct Ingestor {
    cache: Arc<EventCache>,
    monitor: Arc<HealthMonitor>,
    persistence: Option<Arc<PersistenceBridge>>,
}

impl Ingestor {
    pub fn new(
        cache: Arc<EventCache>,
        monitor: Arc<HealthMonitor>,
        persistence: Option<Arc<PersistenceBridge>>,
    ) -> Self {
        Self {
            cache,
            monitor,
            persistence,
        }
    }

    /// Accepts one decoded event.
    ///
    /// Records delivery latency (receipt minus origination, floored at
    /// zero), queues the durable write, then updates the cache.
    pub fn ingest(&self, event: HookEvent) {
        let now = Utc::now();
        let event = event.clamped_to(now);
        let latency_ms = (now - event.timestamp()).num_milliseconds().max(0);
        self.monitor.record_latency(latency_ms as f64);
        self.monitor.record_event();

        if let Some(bridge) = &self.persistence {
            bridge.enqueue(&event);
        }

        let id = event.id().clone();
        let outcome = self.cache.add(event);
        trace!(
            event_id = %id,
            replaced = outcome.replaced,
            evicted = outcome.evicted,
            "Event ingested"
        );
    }

    /// Subscription backlog after the last receive.
    pub fn queue_depth(&self, pending: usize) {
        self.monitor.update_queue_size(pending);
    }

    /// Time taken to connect and subscribe.
    pub fn handshake_latency(&self, latency_ms: f64) {
        self.monitor.record_latency(latency_ms);
    }

    /// Called after a reconnection succeeds.
    pub fn connection_restored(&self) {
        self.monitor.reset();
    }
}
