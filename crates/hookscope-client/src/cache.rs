//! Adaptive bounded event cache.
//!
//! Holds the most recent hook events in memory, keyed by [`EventId`].
//! Capacity adapts to memory pressure: it shrinks while the host is under
//! pressure and grows back in fixed steps once usage drops.
//!
//! Every mutation publishes a fresh snapshot, sorted by timestamp with the
//! newest event first, on a `watch` channel. Readers never observe a
//! partially applied insert.
//!
//! Eviction is by insertion order, which approximates recency because the
//! broker delivers events roughly in the order they happen.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Capacity arithmetic saturates and stays within [`MIN_MEMORY_EVENTS`]..=[`MAX_MEMORY_EVENTS`]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use hookscope_core::{EventId, HookEvent};

use crate::config::{CacheConfig, MAX_MEMORY_EVENTS, MIN_MEMORY_EVENTS};

/// Usage above which capacity is halved.
pub const SEVERE_PRESSURE_PERCENT: f64 = 85.0;

/// Usage above which capacity is cut to three quarters.
pub const MODERATE_PRESSURE_PERCENT: f64 = 70.0;

/// Usage below which capacity recovers.
pub const RECOVERY_PERCENT: f64 = 60.0;

/// Capacity regained per recovery step.
pub const GROWTH_STEP: usize = 100;

/// Immutable, timestamp-descending view of the cache.
pub type EventSnapshot = Arc<Vec<HookEvent>>;

/// Result of a single insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    /// An event with the same id was replaced.
    pub replaced: bool,
    /// Oldest-inserted events dropped to stay within capacity.
    pub evicted: usize,
}

/// Capacity change made by a pressure check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureChange {
    Unchanged,
    Shrunk { from: usize, to: usize, evicted: usize },
    Grown { from: usize, to: usize },
}

/// Running counters, reset only with the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub inserted: u64,
    pub replaced: u64,
    pub evicted: u64,
    pub purged: u64,
    pub shrinks: u64,
    pub growths: u64,
}

struct CacheInner {
    /// Insertion order, oldest at the front.
    events: VecDeque<HookEvent>,
    ids: HashSet<EventId>,
    current_max: usize,
    pressure_mode: bool,
    stats: CacheStats,
}

impl CacheInner {
    /// Evicts oldest-inserted events until within `current_max`.
    fn trim(&mut self) -> usize {
        let mut evicted = 0;
        while self.events.len() > self.current_max {
            match self.events.pop_front() {
                Some(old) => {
                    self.ids.remove(old.id());
                    evicted += 1;
                }
                None => break,
            }
        }
        self.stats.evicted += evicted as u64;
        evicted
    }

    fn insert(&mut self, event: HookEvent) -> bool {
        let replaced = !self.ids.insert(event.id().clone());
        if replaced {
            let id = event.id().clone();
            self.events.retain(|e| e.id() != &id);
            self.stats.replaced += 1;
        } else {
            self.stats.inserted += 1;
        }
        self.events.push_back(event);
        replaced
    }

    /// Newest first; ties keep the later insert in front.
    fn sorted(&self) -> Vec<HookEvent> {
        let mut sorted: Vec<HookEvent> = self.events.iter().rev().cloned().collect();
        sorted.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        sorted
    }
}

/// Bounded, pressure-aware event cache.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct EventCache {
    inner: Mutex<CacheInner>,
    snapshot_tx: watch::Sender<EventSnapshot>,
    configured_max: usize,
    display_limit: usize,
    max_age: chrono::Duration,
}

impl EventCache {
    /// Creates an empty cache. `max_events` is clamped to
    /// [`MIN_MEMORY_EVENTS`]..=[`MAX_MEMORY_EVENTS`] whether or not the
    /// settings were validated.
    pub fn new(config: &CacheConfig) -> Self {
        let configured_max = config.max_events.clamp(MIN_MEMORY_EVENTS, MAX_MEMORY_EVENTS);
        let (snapshot_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            inner: Mutex::new(CacheInner {
                events: VecDeque::with_capacity(configured_max.min(1_024)),
                ids: HashSet::new(),
                current_max: configured_max,
                pressure_mode: false,
                stats: CacheStats::default(),
            }),
            snapshot_tx,
            configured_max,
            display_limit: config.display_limit.clamp(1, configured_max),
            max_age: config.max_event_age(),
        }
    }

    /// Inserts or replaces an event, then evicts down to capacity.
    ///
    /// Future-dated events are clamped to the time of receipt.
    pub fn add(&self, event: HookEvent) -> AddOutcome {
        let event = event.clamped_to(Utc::now());
        let mut inner = self.inner.lock();
        let replaced = inner.insert(event);
        let evicted = inner.trim();
        self.publish(&inner);
        AddOutcome { replaced, evicted }
    }

    /// Seeds the cache with previously stored events.
    ///
    /// Keeps the newest `current_max` of `events`; ids already cached win.
    /// Returns how many were loaded.
    pub fn prime(&self, mut events: Vec<HookEvent>) -> usize {
        let now = Utc::now();
        events.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));

        let mut inner = self.inner.lock();
        let room = inner.current_max.saturating_sub(inner.events.len());
        let mut loaded = 0;
        // Newest first onto the front: the oldest loaded ends up evicted first.
        for event in events {
            if loaded >= room {
                break;
            }
            if !inner.ids.insert(event.id().clone()) {
                continue;
            }
            inner.events.push_front(event.clamped_to(now));
            loaded += 1;
        }
        if loaded > 0 {
            self.publish(&inner);
            debug!(loaded, "Primed cache from durable store");
        }
        loaded
    }

    /// Adapts capacity to the host's memory usage (0-100).
    ///
    /// Entering pressure mode above 85% halves capacity; between 70% and
    /// 85% it drops to three quarters. Below 60% pressure mode ends and
    /// capacity grows by [`GROWTH_STEP`] per check until the configured
    /// ceiling is reached.
    /// Capacity never falls below [`MIN_MEMORY_EVENTS`].
    pub fn apply_memory_pressure(&self, usage_percent: f64) -> PressureChange {
        let mut inner = self.inner.lock();
        let from = inner.current_max;

        let change = if usage_percent > SEVERE_PRESSURE_PERCENT && !inner.pressure_mode {
            inner.pressure_mode = true;
            inner.current_max = (from / 2).max(MIN_MEMORY_EVENTS);
            let evicted = inner.trim();
            PressureChange::Shrunk {
                from,
                to: inner.current_max,
                evicted,
            }
        } else if usage_percent > MODERATE_PRESSURE_PERCENT
            && usage_percent <= SEVERE_PRESSURE_PERCENT
            && !inner.pressure_mode
        {
            inner.pressure_mode = true;
            inner.current_max = (from.saturating_mul(3) / 4).max(MIN_MEMORY_EVENTS);
            let evicted = inner.trim();
            PressureChange::Shrunk {
                from,
                to: inner.current_max,
                evicted,
            }
        } else if usage_percent < RECOVERY_PERCENT
            && (inner.pressure_mode || from < self.configured_max)
        {
            inner.pressure_mode = false;
            inner.current_max = from.saturating_add(GROWTH_STEP).min(self.configured_max);
            PressureChange::Grown {
                from,
                to: inner.current_max,
            }
        } else {
            PressureChange::Unchanged
        };

        match change {
            PressureChange::Shrunk { from, to, evicted } if from != to || evicted > 0 => {
                inner.stats.shrinks += 1;
                self.publish(&inner);
                info!(
                    usage_percent,
                    from,
                    to,
                    evicted,
                    pressure_mode = inner.pressure_mode,
                    "Memory pressure: cache capacity reduced"
                );
            }
            PressureChange::Grown { from, to } if from != to => {
                inner.stats.growths += 1;
                info!(usage_percent, from, to, "Memory recovered: cache capacity raised");
            }
            _ => {}
        }
        change
    }

    /// Removes events older than `max_age` relative to `now`.
    pub fn purge_older_than(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.events.len();
        inner.events.retain(|e| e.age_at(now) <= max_age);
        let purged = before - inner.events.len();
        if purged > 0 {
            inner.ids = inner.events.iter().map(|e| e.id().clone()).collect();
            inner.stats.purged += purged as u64;
            self.publish(&inner);
            debug!(purged, "Purged expired events");
        }
        purged
    }

    /// Removes events older than the configured retention.
    pub fn purge_expired(&self) -> usize {
        self.purge_older_than(self.max_age, Utc::now())
    }

    /// Current snapshot, newest first.
    pub fn snapshot(&self) -> EventSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// The newest `display_limit` events.
    pub fn display_snapshot(&self) -> Vec<HookEvent> {
        self.snapshot()
            .iter()
            .take(self.display_limit)
            .cloned()
            .collect()
    }

    /// Change notifications carrying each new snapshot.
    pub fn subscribe(&self) -> watch::Receiver<EventSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn get(&self, id: &EventId) -> Option<HookEvent> {
        let inner = self.inner.lock();
        inner.events.iter().find(|e| e.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity currently in force.
    pub fn current_max(&self) -> usize {
        self.inner.lock().current_max
    }

    /// Capacity from configuration, the recovery ceiling.
    pub fn configured_max(&self) -> usize {
        self.configured_max
    }

    pub fn in_pressure_mode(&self) -> bool {
        self.inner.lock().pressure_mode
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Publishes under the cache lock so snapshots follow mutation order.
    fn publish(&self, inner: &CacheInner) {
        self.snapshot_tx.send_replace(Arc::new(inner.sorted()));
    }
}
