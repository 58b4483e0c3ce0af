//! The assembled ingestion core.
//!
//! [`HookscopeCore`] wires the channel client, cache, persistence bridge,
//! health monitor and supervisor together and runs the cache maintenance
//! ticks (memory pressure and age purge). It is the only type a
//! presentation layer needs.

use std::sync::Arc;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hookscope_core::{ConnectionState, EventId, HookEvent, ReconnectState};

use crate::cache::{CacheStats, EventCache, EventSnapshot, PressureChange};
use crate::channel::{BrokerClient, ChannelError, MessageChannel};
use crate::config::{CacheConfig, HookscopeConfig};
use crate::ingest::Ingestor;
use crate::monitor::{HealthMonitor, PerformanceSnapshot, ResourceProbe, SystemProbe};
use crate::persistence::{PersistenceBridge, PersistenceError};
use crate::supervisor::ConnectionSupervisor;

/// Running ingestion core.
pub struct HookscopeCore {
    config: HookscopeConfig,
    cache: Arc<EventCache>,
    monitor: Arc<HealthMonitor>,
    persistence: Option<Arc<PersistenceBridge>>,
    supervisor: Arc<ConnectionSupervisor>,
    maintenance: CancellationToken,
}

impl HookscopeCore {
    /// Starts the core against the configured broker and the host probe.
    pub async fn start_default(config: HookscopeConfig) -> Self {
        Self::start(
            config,
            Arc::new(BrokerClient::new()),
            Arc::new(SystemProbe::new()),
        )
        .await
    }

    /// Builds every component and starts the background tasks.
    ///
    /// Does not connect; call [`HookscopeCore::connect`]. A durable store
    /// that cannot be opened is logged and the core runs without one.
    pub async fn start(
        config: HookscopeConfig,
        channel: Arc<dyn MessageChannel>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        let cache = Arc::new(EventCache::new(&config.cache));
        let monitor = Arc::new(HealthMonitor::new(config.monitor.clone(), probe));

        let persistence = open_persistence(&config).await;
        if let Some(bridge) = &persistence {
            restore_persistence(bridge, &cache, config.cache.persistence_enabled).await;
        }

        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&cache),
            Arc::clone(&monitor),
            persistence.clone(),
        ));
        let supervisor = ConnectionSupervisor::new(
            channel,
            config.channel.clone(),
            config.reconnect.clone(),
            ingestor,
        );

        monitor.start();
        let maintenance = CancellationToken::new();
        spawn_maintenance(
            Arc::clone(&cache),
            monitor.probe(),
            &config.cache,
            maintenance.clone(),
        );

        info!(
            max_events = cache.configured_max(),
            persistence = persistence.as_ref().is_some_and(|b| b.is_enabled()),
            "Hookscope core started"
        );

        Self {
            config,
            cache,
            monitor,
            persistence,
            supervisor,
            maintenance,
        }
    }

    // ========================================================================
    // Connection
    // ========================================================================

    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.supervisor.connect().await
    }

    pub async fn reconnect(&self) -> Result<(), ChannelError> {
        self.supervisor.reconnect().await
    }

    pub async fn disconnect(&self) {
        self.supervisor.disconnect().await;
    }

    /// Disconnects and stops every background task. Idempotent.
    ///
    /// Queued durable writes still complete.
    pub async fn shutdown(&self) {
        self.supervisor.disconnect().await;
        self.maintenance.cancel();
        self.monitor.stop();
        info!("Hookscope core stopped");
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.supervisor.reconnect_state()
    }

    pub fn subscribe_connection(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.supervisor.subscribe_state()
    }

    pub fn subscribe_reconnection(&self) -> tokio::sync::watch::Receiver<ReconnectState> {
        self.supervisor.subscribe_reconnect()
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn snapshot(&self) -> EventSnapshot {
        self.cache.snapshot()
    }

    pub fn display_snapshot(&self) -> Vec<HookEvent> {
        self.cache.display_snapshot()
    }

    pub fn subscribe_snapshots(&self) -> tokio::sync::watch::Receiver<EventSnapshot> {
        self.cache.subscribe()
    }

    /// Looks an event up in the cache, then in the durable store.
    ///
    /// Every lookup counts towards the cache hit ratio.
    pub async fn find_event(&self, id: &EventId) -> Option<HookEvent> {
        if let Some(event) = self.cache.get(id) {
            self.monitor.record_cache_hit(true);
            return Some(event);
        }
        self.monitor.record_cache_hit(false);

        let bridge = self.persistence.as_ref()?;
        match bridge.get(id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(event_id = %id, error = %e, "Durable lookup failed");
                None
            }
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Runs the memory pressure check now.
    pub fn check_memory_pressure(&self) -> PressureChange {
        let usage = self.monitor.probe().sample().memory_usage_percent();
        self.cache.apply_memory_pressure(usage)
    }

    /// Runs the age purge now.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    // ========================================================================
    // Health
    // ========================================================================

    pub fn subscribe_performance(
        &self,
    ) -> tokio::sync::watch::Receiver<Option<PerformanceSnapshot>> {
        self.monitor.subscribe()
    }

    pub fn performance_history(&self) -> Vec<PerformanceSnapshot> {
        self.monitor.history()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn persistence_enabled(&self) -> bool {
        self.persistence.as_ref().is_some_and(|b| b.is_enabled())
    }

    pub async fn set_persistence_enabled(&self, enabled: bool) -> Result<(), PersistenceError> {
        self.bridge()?.set_enabled(enabled).await
    }

    /// Deletes every durable row; the cache is untouched.
    pub async fn clear_persistence(&self) -> Result<usize, PersistenceError> {
        self.bridge()?.clear().await
    }

    fn bridge(&self) -> Result<&PersistenceBridge, PersistenceError> {
        self.persistence
            .as_deref()
            .ok_or(PersistenceError::Unavailable)
    }

    pub fn config(&self) -> &HookscopeConfig {
        &self.config
    }
}

impl Drop for HookscopeCore {
    fn drop(&mut self) {
        self.maintenance.cancel();
        self.monitor.stop();
    }
}

async fn open_persistence(config: &HookscopeConfig) -> Option<Arc<PersistenceBridge>> {
    let path = config.persistence.resolved_database_path();
    match PersistenceBridge::open(
        &path,
        config.persistence.queue_capacity,
        config.cache.max_persisted_events,
    )
    .await
    {
        Ok(bridge) => {
            debug!(path = %path.display(), "Opened durable store");
            Some(Arc::new(bridge))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Durable store unavailable, continuing without it");
            None
        }
    }
}

/// Applies the remembered preference and primes the cache when enabled.
///
/// A stored preference wins over the configured default.
async fn restore_persistence(bridge: &PersistenceBridge, cache: &EventCache, default: bool) {
    let stored = bridge.stored_preference().await.unwrap_or_else(|e| {
        warn!(error = %e, "Could not read persistence preference");
        None
    });
    let enabled = stored.unwrap_or(default);
    bridge.restore_enabled(enabled);
    if !enabled {
        return;
    }

    match bridge.load_recent(cache.current_max()).await {
        Ok(events) => {
            let loaded = cache.prime(events);
            info!(loaded, "Restored events from durable store");
        }
        Err(e) => warn!(error = %e, "Could not load stored events"),
    }
}

fn spawn_maintenance(
    cache: Arc<EventCache>,
    probe: Arc<dyn ResourceProbe>,
    config: &CacheConfig,
    cancel: CancellationToken,
) {
    let mut pressure = interval(config.pressure_check_interval());
    let mut purge = interval(config.purge_interval());
    pressure.set_missed_tick_behavior(MissedTickBehavior::Delay);
    purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = pressure.tick() => {
                    let usage = probe.sample().memory_usage_percent();
                    cache.apply_memory_pressure(usage);
                }

                _ = purge.tick() => {
                    cache.purge_expired();
                }
            }
        }
        debug!("Cache maintenance task completed");
    });
}
