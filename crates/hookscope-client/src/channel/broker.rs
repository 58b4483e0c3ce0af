//! RESP pub/sub client for the hook event broker.
//!
//! Connection setup: TCP dial (bounded by the connect timeout), optional
//! TLS, `AUTH` when a password is configured, then a `PING` round trip.
//! Subscribing moves the framed connection into a reader task that decodes
//! `message` pushes into [`HookEvent`]s. When the subscription is cancelled
//! the task sends `UNSUBSCRIBE` and hands the connection back.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hookscope_protocol::{decode_hook_event, preview, PubSubFrame, RespCodec, RespCommand, RespValue};

use super::{
    tls, ChannelError, MessageChannel, Subscription, SubscriptionFeed, SUBSCRIPTION_BUFFER,
};
use crate::config::ChannelConfig;

/// Idle time after which a subscribed connection is probed with `PING`.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Silence tolerated before the connection is declared dead.
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(90);

/// Upper bound for a command reply outside the connect handshake.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte stream the codec runs over: plain TCP or TLS.
trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type BrokerConnection = Framed<Box<dyn Transport>, RespCodec>;

struct ActiveSubscription {
    cancel: CancellationToken,
    reader: JoinHandle<Option<BrokerConnection>>,
}

#[derive(Default)]
struct BrokerState {
    config: Option<ChannelConfig>,
    connection: Option<BrokerConnection>,
    active: Option<ActiveSubscription>,
}

/// [`MessageChannel`] backed by a RESP2 broker.
#[derive(Default)]
pub struct BrokerClient {
    state: Mutex<BrokerState>,
}

impl BrokerClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageChannel for BrokerClient {
    async fn connect(&self, config: &ChannelConfig) -> Result<(), ChannelError> {
        self.disconnect().await;

        let address = config.address();
        debug!(address = %address, tls = config.tls, "Connecting to broker");

        let connection = timeout(config.connect_timeout(), open_connection(config))
            .await
            .map_err(|_| ChannelError::Timeout {
                address: address.clone(),
                timeout_secs: config.connect_timeout_secs,
            })??;

        let mut state = self.state.lock().await;
        state.connection = Some(connection);
        state.config = Some(config.clone());

        info!(address = %address, tls = config.tls, "Connected to broker");
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, ChannelError> {
        let mut state = self.state.lock().await;

        if let Some(active) = state.active.take() {
            if !active.cancel.is_cancelled() && !active.reader.is_finished() {
                state.active = Some(active);
                return Err(ChannelError::AlreadySubscribed);
            }
            active.cancel.cancel();
            if let Ok(Some(connection)) = active.reader.await {
                state.connection = Some(connection);
            }
        }

        let topic = state
            .config
            .as_ref()
            .map(|c| c.topic.clone())
            .ok_or(ChannelError::NotConnected)?;
        let mut connection = state.connection.take().ok_or(ChannelError::NotConnected)?;

        connection.send(RespCommand::subscribe(&topic)).await?;
        timeout(REPLY_TIMEOUT, await_subscribed(&mut connection, &topic))
            .await
            .map_err(|_| ChannelError::UnexpectedReply {
                command: "SUBSCRIBE".to_string(),
                reply: "no confirmation".to_string(),
            })??;

        let (feed, subscription) = Subscription::channel(topic.clone(), SUBSCRIPTION_BUFFER);
        let cancel = feed.cancel_token();
        let reader = tokio::spawn(read_loop(connection, feed, topic.clone()));
        state.active = Some(ActiveSubscription { cancel, reader });

        info!(topic = %topic, "Subscribed to hook events");
        Ok(subscription)
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock().await;

        if let Some(active) = state.active.take() {
            active.cancel.cancel();
            // The reader unsubscribes before handing the connection back;
            // dropping it afterwards closes the socket.
            let _ = active.reader.await;
        }
        if state.connection.take().is_some() {
            info!("Disconnected from broker");
        }
    }
}

// ============================================================================
// Connection Setup
// ============================================================================

async fn open_connection(config: &ChannelConfig) -> Result<BrokerConnection, ChannelError> {
    let address = config.address();
    let tcp = TcpStream::connect(&address)
        .await
        .map_err(|source| ChannelError::Connect {
            address: address.clone(),
            source,
        })?;
    let _ = tcp.set_nodelay(true);

    let transport: Box<dyn Transport> = if config.tls {
        Box::new(tls::connect(config, tcp).await?)
    } else {
        Box::new(tcp)
    };
    let mut connection = Framed::new(transport, RespCodec);

    if let Some(password) = config.password.as_deref() {
        let reply = request(
            &mut connection,
            RespCommand::auth(config.username.as_deref(), password),
        )
        .await?;
        if !matches!(&reply, RespValue::Simple(s) if s.eq_ignore_ascii_case("OK")) {
            return Err(unexpected("AUTH", &reply));
        }
        debug!("Broker authentication accepted");
    }

    let reply = request(&mut connection, RespCommand::ping()).await?;
    if PubSubFrame::classify(reply.clone()) != PubSubFrame::Pong {
        return Err(unexpected("PING", &reply));
    }

    Ok(connection)
}

/// Sends a command and reads exactly one reply.
async fn request(
    connection: &mut BrokerConnection,
    command: RespCommand,
) -> Result<RespValue, ChannelError> {
    let name = command.name();
    connection.send(command).await?;
    match connection.next().await {
        Some(Ok(RespValue::Error(reason))) => Err(ChannelError::Rejected {
            command: name,
            reason,
        }),
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(e.into()),
        None => Err(ChannelError::Closed),
    }
}

async fn await_subscribed(
    connection: &mut BrokerConnection,
    topic: &str,
) -> Result<(), ChannelError> {
    loop {
        let value = match connection.next().await {
            Some(value) => value?,
            None => return Err(ChannelError::Closed),
        };
        match PubSubFrame::classify(value) {
            PubSubFrame::Subscribed { channel, .. } if channel == topic => return Ok(()),
            PubSubFrame::Error(reason) => {
                return Err(ChannelError::Rejected {
                    command: "SUBSCRIBE".to_string(),
                    reason,
                })
            }
            other => debug!(frame = ?other, "Ignoring frame while awaiting subscription"),
        }
    }
}

fn unexpected(command: &str, reply: &RespValue) -> ChannelError {
    ChannelError::UnexpectedReply {
        command: command.to_string(),
        reply: format!("{reply:?}"),
    }
}

// ============================================================================
// Reader Task
// ============================================================================

/// Drives a subscribed connection until cancellation or failure.
///
/// Returns the connection when it was cleanly unsubscribed and can be
/// reused, `None` when it is gone.
async fn read_loop(
    mut connection: BrokerConnection,
    feed: SubscriptionFeed,
    topic: String,
) -> Option<BrokerConnection> {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = feed.cancelled() => {
                return unsubscribe(connection, &topic).await;
            }

            frame = connection.next() => {
                let value = match frame {
                    Some(Ok(value)) => value,
                    Some(Err(e)) => {
                        warn!(error = %e, "Broker stream failed");
                        feed.deliver(Err(e.into())).await;
                        return None;
                    }
                    None => {
                        warn!("Broker closed the subscription connection");
                        feed.deliver(Err(ChannelError::Closed)).await;
                        return None;
                    }
                };
                last_seen = Instant::now();

                match PubSubFrame::classify(value) {
                    PubSubFrame::Message { channel, payload } if channel == topic => {
                        match decode_hook_event(&payload, Utc::now()) {
                            Ok(event) => {
                                // A refused delivery means the consumer cancelled;
                                // the next iteration unsubscribes.
                                let _ = feed.deliver(Ok(event)).await;
                            }
                            Err(e) => {
                                warn!(
                                    error = %e,
                                    payload = %preview(&payload),
                                    "Discarding malformed hook event"
                                );
                            }
                        }
                    }
                    PubSubFrame::Error(reason) => {
                        warn!(reason = %reason, "Broker reported an error on the subscription");
                        feed.deliver(Err(ChannelError::Rejected {
                            command: "SUBSCRIBE".to_string(),
                            reason,
                        }))
                        .await;
                        return None;
                    }
                    other => debug!(frame = ?other, "Ignoring non-message frame"),
                }
            }

            _ = keepalive.tick() => {
                if last_seen.elapsed() >= KEEPALIVE_TIMEOUT {
                    warn!(silent_secs = last_seen.elapsed().as_secs(), "Broker keepalive timed out");
                    feed.deliver(Err(ChannelError::Closed)).await;
                    return None;
                }
                if let Err(e) = connection.send(RespCommand::ping()).await {
                    warn!(error = %e, "Keepalive ping failed");
                    feed.deliver(Err(e.into())).await;
                    return None;
                }
            }
        }
    }
}

async fn unsubscribe(mut connection: BrokerConnection, topic: &str) -> Option<BrokerConnection> {
    if let Err(e) = connection.send(RespCommand::unsubscribe(topic)).await {
        debug!(error = %e, "UNSUBSCRIBE failed, dropping connection");
        return None;
    }

    let confirmed = timeout(REPLY_TIMEOUT, async {
        while let Some(Ok(value)) = connection.next().await {
            if let PubSubFrame::Unsubscribed { channel, .. } = PubSubFrame::classify(value) {
                if channel == topic {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if confirmed {
        debug!(topic = %topic, "Unsubscribed");
        Some(connection)
    } else {
        debug!(topic = %topic, "No UNSUBSCRIBE confirmation, dropping connection");
        None
    }
}
