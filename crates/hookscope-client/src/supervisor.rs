//! Connection supervisor: owns the observable connection state machine.
//!
//! The supervisor issues connect/disconnect to the [`MessageChannel`],
//! pumps the resulting [`Subscription`] into the [`Ingestor`], and recovers
//! from subscription faults with bounded linear backoff.
//!
//! ```text
//!                connect()                 subscription fault
//! Disconnected ───────────▶ Connecting ──▶ Connected ─────────▶ Error
//!      ▲                        │                                 │
//!      │                        └──── failure ──▶ Error           │ retry loop:
//!      │                                                          │ attempt n waits
//!      └──────────── disconnect() from any state ◀────────────────┘ n × base delay
//! ```
//!
//! Every connection lifetime ("generation") carries a
//! [`CancellationToken`]. `disconnect()` cancels the current generation
//! before touching the channel, so in-flight attempts and retry sleeps stop
//! immediately and cannot publish stale state afterwards.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel failures surface as `ConnectionState::Error` and are logged

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hookscope_core::{ConnectionState, ReconnectState};

use crate::channel::{ChannelError, MessageChannel, Subscription};
use crate::config::{ChannelConfig, ReconnectPolicy};
use crate::ingest::Ingestor;

/// Clears the reconnecting flag however the retry loop ends.
struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Supervises one broker subscription.
pub struct ConnectionSupervisor {
    channel: Arc<dyn MessageChannel>,
    config: ChannelConfig,
    policy: ReconnectPolicy,
    ingestor: Arc<Ingestor>,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_tx: watch::Sender<ReconnectState>,
    generation: Mutex<CancellationToken>,
    /// Serializes connect attempts against each other and `disconnect`.
    establish_lock: tokio::sync::Mutex<()>,
    reconnecting: AtomicBool,
}

impl ConnectionSupervisor {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        config: ChannelConfig,
        policy: ReconnectPolicy,
        ingestor: Arc<Ingestor>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        let (reconnect_tx, _) = watch::channel(ReconnectState::default());
        Arc::new(Self {
            channel,
            config,
            policy,
            ingestor,
            state_tx,
            reconnect_tx,
            generation: Mutex::new(CancellationToken::new()),
            establish_lock: tokio::sync::Mutex::new(()),
            reconnecting: AtomicBool::new(false),
        })
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        *self.reconnect_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_reconnect(&self) -> watch::Receiver<ReconnectState> {
        self.reconnect_tx.subscribe()
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Connects and subscribes once.
    ///
    /// Succeeds immediately when already connected.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Busy` while another attempt or a reconnection runs
    /// - any connect/subscribe failure (state becomes `Error`)
    pub async fn connect(self: &Arc<Self>) -> Result<(), ChannelError> {
        let state = self.state();
        if state.is_connected() {
            return Ok(());
        }
        if !state.can_connect() || self.reconnecting.load(Ordering::Acquire) {
            return Err(ChannelError::Busy);
        }

        let token = self.generation_token();
        if let Some(subscription) = self.establish(&token).await? {
            self.spawn_driver(subscription, token);
        }
        Ok(())
    }

    /// Runs the bounded reconnection flow on request.
    ///
    /// Allowed from `Error` and `Disconnected`, including after a previous
    /// flow ended in `Failed`.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Busy` if a reconnection is already running
    /// - `ChannelError::RetriesExhausted` when every attempt failed
    /// - `ChannelError::Cancelled` if `disconnect()` intervened
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), ChannelError> {
        if self.state().is_connected() {
            return Ok(());
        }
        let token = self.generation_token();
        if let Some(subscription) = self.reconnect_with_backoff(&token).await? {
            self.spawn_driver(subscription, token);
        }
        Ok(())
    }

    /// Tears the connection down from any state. Always wins over
    /// in-flight connects and reconnections. Idempotent.
    pub async fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.generation.lock(), CancellationToken::new());
        previous.cancel();

        let _guard = self.establish_lock.lock().await;
        self.channel.disconnect().await;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.reconnect_tx.send_replace(ReconnectState::Idle);
        info!("Disconnected");
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn generation_token(&self) -> CancellationToken {
        self.generation.lock().clone()
    }

    /// Publishes a state unless the generation was cancelled.
    fn publish_state(&self, token: &CancellationToken, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if token.is_cancelled() || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn publish_reconnect(&self, token: &CancellationToken, state: ReconnectState) {
        self.reconnect_tx.send_if_modified(|current| {
            if token.is_cancelled() || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// One connect + subscribe attempt.
    ///
    /// Returns `None` if another caller connected while this one waited.
    async fn establish(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<Subscription>, ChannelError> {
        let _guard = self.establish_lock.lock().await;
        if token.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        if self.state_tx.borrow().is_connected() {
            return Ok(None);
        }

        self.publish_state(token, ConnectionState::Connecting);
        let started = Instant::now();

        let attempt = async {
            self.channel.connect(&self.config).await?;
            self.channel.subscribe().await
        };
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ChannelError::Cancelled),
            result = attempt => result,
        };

        match result {
            Ok(subscription) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
                self.ingestor.handshake_latency(elapsed_ms);
                self.publish_state(token, ConnectionState::Connected);
                info!(
                    address = %self.config.address(),
                    topic = %self.config.topic,
                    handshake_ms = elapsed_ms as u64,
                    "Connected and subscribed"
                );
                Ok(Some(subscription))
            }
            Err(ChannelError::Cancelled) => Err(ChannelError::Cancelled),
            Err(e) => {
                warn!(address = %self.config.address(), error = %e, "Connection attempt failed");
                self.publish_state(token, ConnectionState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Up to `max_attempts` attempts, attempt `n` after `n × base` delay.
    async fn reconnect_with_backoff(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<Subscription>, ChannelError> {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::Busy);
        }
        let _guard = ReconnectGuard(&self.reconnecting);

        let max = self.policy.max_attempts;
        for attempt in 1..=max {
            if token.is_cancelled() {
                return Err(ChannelError::Cancelled);
            }
            self.publish_reconnect(token, ReconnectState::Attempting { attempt, max });

            let delay = self.policy.delay_for(attempt);
            info!(attempt, max, delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ChannelError::Cancelled),
                _ = sleep(delay) => {}
            }

            match self.establish(token).await {
                Ok(Some(subscription)) => {
                    self.publish_reconnect(token, ReconnectState::Succeeded);
                    self.ingestor.connection_restored();
                    self.schedule_idle(token.clone());
                    info!(attempt, "Reconnected");
                    return Ok(Some(subscription));
                }
                Ok(None) => {
                    self.publish_reconnect(token, ReconnectState::Idle);
                    debug!(attempt, "Connected elsewhere, reconnection not needed");
                    return Ok(None);
                }
                Err(ChannelError::Cancelled) => return Err(ChannelError::Cancelled),
                Err(e) => warn!(attempt, max, error = %e, "Reconnection attempt failed"),
            }
        }

        self.publish_reconnect(token, ReconnectState::Failed);
        error!(attempts = max, "Reconnection failed, giving up until requested");
        Err(ChannelError::RetriesExhausted { attempts: max })
    }

    /// Returns `Succeeded` to `Idle` after the grace period.
    fn schedule_idle(&self, token: CancellationToken) {
        let reconnect_tx = self.reconnect_tx.clone();
        let grace = self.policy.success_grace();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = sleep(grace) => {
                    reconnect_tx.send_if_modified(|state| {
                        if *state == ReconnectState::Succeeded {
                            *state = ReconnectState::Idle;
                            return true;
                        }
                        false
                    });
                }
            }
        });
    }

    fn spawn_driver(self: &Arc<Self>, subscription: Subscription, token: CancellationToken) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.drive(subscription, token).await });
    }

    /// Pumps events until a fault, recovers, and repeats until the
    /// generation is cancelled or retries run out.
    async fn drive(self: Arc<Self>, mut subscription: Subscription, token: CancellationToken) {
        loop {
            let reason = match self.pump(&mut subscription, &token).await {
                Some(reason) => reason,
                None => {
                    debug!("Subscription pump stopped");
                    return;
                }
            };
            drop(subscription);

            warn!(reason = %reason, "Subscription fault, starting reconnection");
            self.publish_state(&token, ConnectionState::Error(reason));

            subscription = match self.reconnect_with_backoff(&token).await {
                Ok(Some(next)) => next,
                Ok(None) | Err(_) => return,
            };
        }
    }

    /// Feeds events into the ingestor. Returns the fault reason, or `None`
    /// when the generation was cancelled.
    async fn pump(
        &self,
        subscription: &mut Subscription,
        token: &CancellationToken,
    ) -> Option<String> {
        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    subscription.cancel();
                    return None;
                }
                item = subscription.next() => item,
            };

            match item {
                Some(Ok(event)) => {
                    self.ingestor.queue_depth(subscription.pending());
                    self.ingestor.ingest(event);
                }
                Some(Err(e)) => return Some(e.to_string()),
                None if token.is_cancelled() => return None,
                None => return Some(ChannelError::Closed.to_string()),
            }
        }
    }
}
