//! Health and throughput monitoring for the ingestion pipeline.
//!
//! Tracks, on a fixed tick:
//! - arrival rate over a sliding 5 second window
//! - delivery latency (mean of the last 10 samples)
//! - cache hit ratio of event lookups
//! - subscription queue depth
//! - host memory and CPU usage through a [`ResourceProbe`]
//!
//! Each tick produces a [`PerformanceSnapshot`] that is published on a
//! `watch` channel and appended to a bounded history ring. The monitor is
//! an ordinary owned value; start and stop it explicitly.
//!
//! # Panic-Free Guarantees
//!
//! All code follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Ratios guard against empty windows and clamp into range

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;

/// Sliding window for the arrival rate.
pub const RATE_WINDOW: Duration = Duration::from_secs(5);

/// Latency samples averaged into `connection_latency_ms`.
pub const LATENCY_SAMPLES: usize = 10;

/// Lookups after which the hit ratio starts over.
pub const HIT_RATE_RESET_ATTEMPTS: u32 = 100;

/// Arrival timestamps kept at most, whatever the rate.
const MAX_RATE_SAMPLES: usize = 50_000;

// ============================================================================
// Resource Probe
// ============================================================================

/// Host resource usage at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub memory_used: u64,
    pub memory_total: u64,
    /// Real CPU usage (0-100) when the platform reports one.
    pub cpu_percent: Option<f32>,
}

impl ResourceSample {
    /// Memory in use as a percentage of total (0 when unknown).
    pub fn memory_usage_percent(&self) -> f64 {
        if self.memory_total == 0 {
            return 0.0;
        }
        (self.memory_used as f64 / self.memory_total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Source of host resource usage.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// [`ResourceProbe`] backed by `sysinfo`.
///
/// CPU usage needs two refreshes to produce a value, so the first sample
/// reports none.
pub struct SystemProbe {
    system: Mutex<System>,
    cpu_primed: AtomicBool,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            cpu_primed: AtomicBool::new(false),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceSample {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_cpu_usage();

        let cpu_percent = if sysinfo::IS_SUPPORTED_SYSTEM
            && self.cpu_primed.swap(true, Ordering::AcqRel)
        {
            Some(system.global_cpu_usage()).filter(|v| v.is_finite())
        } else {
            None
        };

        ResourceSample {
            memory_used: system.used_memory(),
            memory_total: system.total_memory(),
            cpu_percent,
        }
    }
}

/// [`ResourceProbe`] returning whatever was last set. For tests and
/// environments without a usable system probe.
#[derive(Debug, Default)]
pub struct FixedProbe {
    sample: Mutex<ResourceSample>,
}

impl FixedProbe {
    pub fn new(sample: ResourceSample) -> Self {
        Self {
            sample: Mutex::new(sample),
        }
    }

    /// A probe reporting `percent` memory usage and no CPU figure.
    pub fn with_memory_percent(percent: f64) -> Self {
        let probe = Self::default();
        probe.set_memory_percent(percent);
        probe
    }

    pub fn set(&self, sample: ResourceSample) {
        *self.sample.lock() = sample;
    }

    pub fn set_memory_percent(&self, percent: f64) {
        let total: u64 = 1_000_000;
        let used = (percent.clamp(0.0, 100.0) / 100.0 * total as f64).round() as u64;
        let mut sample = self.sample.lock();
        sample.memory_total = total;
        sample.memory_used = used;
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> ResourceSample {
        *self.sample.lock()
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => Self::Healthy,
            50..=79 => Self::Degraded,
            _ => Self::Critical,
        }
    }
}

/// One monitor tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub memory_used: u64,
    pub memory_max: u64,
    pub memory_usage_percent: f64,
    pub events_per_second: f64,
    pub connection_latency_ms: f64,
    pub cache_hit_rate: f64,
    pub queue_size: usize,
    pub cpu_usage_percent: f64,
    /// `cpu_usage_percent` is the estimate, not a measurement.
    pub cpu_estimated: bool,
    pub health_score: u8,
    pub health: HealthStatus,
}

/// CPU estimate used when no real counter is available.
///
/// `min(20, queue * 0.5) + memory% * 0.1 + min(30, eps * 2)`, clamped to
/// 0-100.
pub fn estimate_cpu(queue_size: usize, memory_percent: f64, events_per_second: f64) -> f64 {
    let queue = (queue_size as f64 * 0.5).min(20.0);
    let memory = memory_percent * 0.1;
    let rate = (events_per_second * 2.0).min(30.0);
    (queue + memory + rate).clamp(0.0, 100.0)
}

/// Health score (0-100); each strained signal costs points.
pub fn health_score(
    memory_percent: f64,
    latency_ms: f64,
    queue_size: usize,
    cache_hit_rate: f64,
    cpu_percent: f64,
) -> u8 {
    let mut score: i32 = 100;

    if memory_percent > 90.0 {
        score -= 40;
    } else if memory_percent > 75.0 {
        score -= 20;
    }
    if latency_ms > 1_000.0 {
        score -= 20;
    } else if latency_ms > 500.0 {
        score -= 10;
    }
    if queue_size > 100 {
        score -= 20;
    } else if queue_size > 50 {
        score -= 10;
    }
    if cache_hit_rate < 0.5 {
        score -= 10;
    }
    if cpu_percent > 90.0 {
        score -= 10;
    }

    u8::try_from(score.clamp(0, 100)).unwrap_or(0)
}

// ============================================================================
// Monitor
// ============================================================================

#[derive(Default)]
struct RollingWindow {
    arrivals: VecDeque<Instant>,
    latencies: VecDeque<f64>,
    cache_hits: u32,
    cache_attempts: u32,
    queue_size: usize,
}

impl RollingWindow {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.arrivals.front() {
            if now.duration_since(oldest) > RATE_WINDOW {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
    }

    fn events_per_second(&mut self, now: Instant) -> f64 {
        self.prune(now);
        self.arrivals.len() as f64 / RATE_WINDOW.as_secs_f64()
    }

    fn mean_latency(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
    }

    /// No lookups yet counts as a perfect ratio.
    fn hit_rate(&self) -> f64 {
        if self.cache_attempts == 0 {
            return 1.0;
        }
        f64::from(self.cache_hits) / f64::from(self.cache_attempts)
    }
}

/// Periodic health sampler.
pub struct HealthMonitor {
    config: MonitorConfig,
    probe: Arc<dyn ResourceProbe>,
    running: AtomicBool,
    window: Mutex<RollingWindow>,
    history: Mutex<VecDeque<PerformanceSnapshot>>,
    snapshot_tx: watch::Sender<Option<PerformanceSnapshot>>,
    task: Mutex<Option<CancellationToken>>,
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig, probe: Arc<dyn ResourceProbe>) -> Self {
        let (snapshot_tx, _) = watch::channel(None);
        Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_len)),
            config,
            probe,
            running: AtomicBool::new(false),
            window: Mutex::new(RollingWindow::default()),
            snapshot_tx,
            task: Mutex::new(None),
        }
    }

    /// Starts the sampling loop. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *task = Some(cancel.clone());
        self.running.store(true, Ordering::Release);

        let monitor = Arc::clone(self);
        let period = self.config.sample_interval();
        tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_ms = period.as_millis() as u64,
                "Health monitor started"
            );

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    _ = tick.tick() => {
                        let snapshot = monitor.sample();
                        log_snapshot(&snapshot);
                    }
                }
            }

            debug!("Health monitor task completed");
        });
    }

    /// Stops the sampling loop and clears rolling state. Idempotent.
    ///
    /// History and the last published snapshot are kept.
    pub fn stop(&self) {
        let cancel = self.task.lock().take();
        self.running.store(false, Ordering::Release);
        if let Some(cancel) = cancel {
            cancel.cancel();
            *self.window.lock() = RollingWindow::default();
            info!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn record_event(&self) {
        if !self.is_running() {
            return;
        }
        let now = Instant::now();
        let mut window = self.window.lock();
        window.prune(now);
        if window.arrivals.len() >= MAX_RATE_SAMPLES {
            window.arrivals.pop_front();
        }
        window.arrivals.push_back(now);
    }

    pub fn record_latency(&self, latency_ms: f64) {
        if !self.is_running() || !latency_ms.is_finite() {
            return;
        }
        let mut window = self.window.lock();
        if window.latencies.len() >= LATENCY_SAMPLES {
            window.latencies.pop_front();
        }
        window.latencies.push_back(latency_ms.max(0.0));
    }

    pub fn record_cache_hit(&self, hit: bool) {
        if !self.is_running() {
            return;
        }
        let mut window = self.window.lock();
        if window.cache_attempts >= HIT_RATE_RESET_ATTEMPTS {
            window.cache_attempts = 0;
            window.cache_hits = 0;
        }
        window.cache_attempts += 1;
        if hit {
            window.cache_hits += 1;
        }
    }

    pub fn update_queue_size(&self, queue_size: usize) {
        if !self.is_running() {
            return;
        }
        self.window.lock().queue_size = queue_size;
    }

    /// Clears rolling windows; the loop keeps running.
    pub fn reset(&self) {
        *self.window.lock() = RollingWindow::default();
        debug!("Health monitor state reset");
    }

    /// Takes one sample now, records it in history and publishes it.
    pub fn sample(&self) -> PerformanceSnapshot {
        let resources = self.probe.sample();
        let (events_per_second, latency, hit_rate, queue_size) = {
            let mut window = self.window.lock();
            (
                window.events_per_second(Instant::now()),
                window.mean_latency(),
                window.hit_rate(),
                window.queue_size,
            )
        };

        let memory_percent = resources.memory_usage_percent();
        let (cpu, cpu_estimated) = match resources.cpu_percent {
            Some(cpu) => (f64::from(cpu).clamp(0.0, 100.0), false),
            None => (
                estimate_cpu(queue_size, memory_percent, events_per_second),
                true,
            ),
        };
        let score = health_score(memory_percent, latency, queue_size, hit_rate, cpu);

        let snapshot = PerformanceSnapshot {
            timestamp: Utc::now(),
            memory_used: resources.memory_used,
            memory_max: resources.memory_total,
            memory_usage_percent: memory_percent,
            events_per_second,
            connection_latency_ms: latency,
            cache_hit_rate: hit_rate,
            queue_size,
            cpu_usage_percent: cpu,
            cpu_estimated,
            health_score: score,
            health: HealthStatus::from_score(score),
        };

        {
            let mut history = self.history.lock();
            while history.len() >= self.config.history_len.max(1) {
                history.pop_front();
            }
            history.push_back(snapshot.clone());
        }
        self.snapshot_tx.send_replace(Some(snapshot.clone()));
        snapshot
    }

    pub fn latest(&self) -> Option<PerformanceSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<PerformanceSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PerformanceSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Probe shared with the cache's pressure check.
    pub fn probe(&self) -> Arc<dyn ResourceProbe> {
        Arc::clone(&self.probe)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(cancel) = self.task.get_mut().take() {
            cancel.cancel();
        }
    }
}

fn log_snapshot(snapshot: &PerformanceSnapshot) {
    match snapshot.health {
        HealthStatus::Critical => warn!(
            score = snapshot.health_score,
            memory_percent = format!("{:.1}", snapshot.memory_usage_percent),
            eps = format!("{:.1}", snapshot.events_per_second),
            latency_ms = format!("{:.0}", snapshot.connection_latency_ms),
            queue = snapshot.queue_size,
            "CRITICAL: ingestion health degraded"
        ),
        _ => debug!(
            score = snapshot.health_score,
            eps = format!("{:.1}", snapshot.events_per_second),
            queue = snapshot.queue_size,
            "Health sample"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(probe: FixedProbe) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(
            MonitorConfig {
                sample_interval_ms: 1_000,
                history_len: 3,
            },
            Arc::new(probe),
        ))
    }

    #[test]
    fn test_estimate_cpu_formula() {
        assert_eq!(estimate_cpu(0, 0.0, 0.0), 0.0);
        assert!((estimate_cpu(10, 50.0, 5.0) - (5.0 + 5.0 + 10.0)).abs() < 1e-9);
        // Queue and rate terms saturate
        assert!((estimate_cpu(1_000, 100.0, 1_000.0) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_health_score_bands() {
        assert_eq!(health_score(10.0, 5.0, 0, 1.0, 5.0), 100);
        assert_eq!(HealthStatus::from_score(100), HealthStatus::Healthy);

        let strained = health_score(95.0, 2_000.0, 500, 0.1, 95.0);
        assert_eq!(strained, 0);
        assert_eq!(HealthStatus::from_score(strained), HealthStatus::Critical);

        assert_eq!(HealthStatus::from_score(60), HealthStatus::Degraded);
    }

    #[test]
    fn test_fixed_probe_percent() {
        let probe = FixedProbe::with_memory_percent(90.0);
        assert!((probe.sample().memory_usage_percent() - 90.0).abs() < 1e-6);
        assert!(probe.sample().cpu_percent.is_none());
    }

    #[tokio::test]
    async fn test_recording_ignored_while_stopped() {
        let monitor = monitor(FixedProbe::with_memory_percent(10.0));
        monitor.record_event();
        monitor.record_latency(500.0);
        monitor.update_queue_size(7);

        let snapshot = monitor.sample();
        assert_eq!(snapshot.events_per_second, 0.0);
        assert_eq!(snapshot.connection_latency_ms, 0.0);
        assert_eq!(snapshot.queue_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_slides() {
        let monitor = monitor(FixedProbe::with_memory_percent(10.0));
        monitor.start();
        for _ in 0..10 {
            monitor.record_event();
        }
        assert!((monitor.sample().events_per_second - 2.0).abs() < 1e-9);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(monitor.sample().events_per_second, 0.0);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_latency_mean_of_last_ten() {
        let monitor = monitor(FixedProbe::with_memory_percent(10.0));
        monitor.start();
        for _ in 0..5 {
            monitor.record_latency(1_000.0);
        }
        for _ in 0..10 {
            monitor.record_latency(100.0);
        }
        assert!((monitor.sample().connection_latency_ms - 100.0).abs() < 1e-9);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_hit_rate_resets_after_hundred_attempts() {
        let monitor = monitor(FixedProbe::with_memory_percent(10.0));
        monitor.start();
        for _ in 0..100 {
            monitor.record_cache_hit(false);
        }
        assert_eq!(monitor.sample().cache_hit_rate, 0.0);

        monitor.record_cache_hit(true);
        assert_eq!(monitor.sample().cache_hit_rate, 1.0);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_cpu_estimate_flagged_without_counter() {
        let probe = FixedProbe::with_memory_percent(50.0);
        let monitor = monitor(probe);
        monitor.start();
        monitor.update_queue_size(10);
        let snapshot = monitor.sample();
        assert!(snapshot.cpu_estimated);
        assert!((snapshot.cpu_usage_percent - 10.0).abs() < 1e-6);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_real_cpu_used_when_available() {
        let probe = FixedProbe::new(ResourceSample {
            memory_used: 1,
            memory_total: 4,
            cpu_percent: Some(42.0),
        });
        let snapshot = monitor(probe).sample();
        assert!(!snapshot.cpu_estimated);
        assert_eq!(snapshot.cpu_usage_percent, 42.0);
        assert_eq!(snapshot.memory_usage_percent, 25.0);
    }

    #[tokio::test]
    async fn test_history_bounded_and_published() {
        let monitor = monitor(FixedProbe::with_memory_percent(10.0));
        let rx = monitor.subscribe();
        assert!(rx.borrow().is_none());
        for _ in 0..5 {
            monitor.sample();
        }
        assert_eq!(monitor.history().len(), 3);
        assert!(rx.borrow().is_some());
        assert_eq!(monitor.latest(), monitor.history().last().cloned());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ticks_until_stopped() {
        let monitor = monitor(FixedProbe::with_memory_percent(10.0));
        monitor.start();
        monitor.start();
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(monitor.history().len(), 3);

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
        let before = monitor.latest();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(monitor.latest(), before);
    }

    #[tokio::test]
    async fn test_stop_clears_rolling_state() {
        let monitor = monitor(FixedProbe::with_memory_percent(10.0));
        monitor.start();
        monitor.update_queue_size(40);
        monitor.record_latency(300.0);
        monitor.stop();
        let snapshot = monitor.sample();
        assert_eq!(snapshot.queue_size, 0);
        assert_eq!(snapshot.connection_latency_ms, 0.0);
    }
}
