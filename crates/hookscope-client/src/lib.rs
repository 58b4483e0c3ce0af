//! hookscope client - resilient ingestion core for Claude Code hook events
//!
//! Consumes hook events published on a pub/sub broker and keeps a bounded,
//! always-fresh view of them for a presentation layer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐ RESP/TLS ┌───────────────┐ Subscription ┌────────────┐
//! │  Broker  │─────────▶│ BrokerClient  │─────────────▶│ Supervisor │
//! └──────────┘          └───────────────┘              └─────┬──────┘
//!                                                            │ ingest
//!                          ┌─────────────────────────────────┼───────────────┐
//!                          ▼                                 ▼               ▼
//!                   ┌────────────┐                  ┌──────────────┐ ┌──────────────┐
//!                   │ EventCache │──watch snapshots▶│ presentation │ │ Persistence  │
//!                   └────────────┘                  └──────────────┘ │ (SQLite)     │
//!                          ▲ pressure / purge ticks                  └──────────────┘
//!                   ┌──────────────┐
//!                   │HealthMonitor │──watch PerformanceSnapshot──▶ presentation
//!                   └──────────────┘
//! ```
//!
//! [`HookscopeCore`] assembles all of it:
//!
//! ```ignore
//! let config = HookscopeConfig::load(None)?;
//! let core = HookscopeCore::start_default(config).await;
//! core.connect().await?;
//!
//! let mut snapshots = core.subscribe_snapshots();
//! while snapshots.changed().await.is_ok() {
//!     let events = snapshots.borrow_and_update().clone();
//!     // render events, newest first
//! }
//! ```
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod cache;
pub mod channel;
pub mod config;
pub mod ingest;
pub mod monitor;
pub mod persistence;
pub mod runtime;
pub mod supervisor;

pub use cache::{AddOutcome, CacheStats, EventCache, EventSnapshot, PressureChange};
pub use channel::{
    BrokerClient, ChannelError, MessageChannel, Subscription, SubscriptionFeed, SubscriptionItem,
};
pub use config::{
    CacheConfig, ChannelConfig, ConfigError, HookscopeConfig, MonitorConfig, PersistenceConfig,
    ReconnectPolicy, TlsFallback,
};
pub use ingest::Ingestor;
pub use monitor::{
    FixedProbe, HealthMonitor, HealthStatus, PerformanceSnapshot, ResourceProbe, ResourceSample,
    SystemProbe,
};
pub use persistence::{EventStore, PersistenceBridge, PersistenceError};
pub use runtime::HookscopeCore;
pub use supervisor::ConnectionSupervisor;
