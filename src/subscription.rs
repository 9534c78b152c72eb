//! Subscription manager: one durable, bounded subscription that survives reconnects
//!
//! Establishing a subscription opens a dedicated channel, applies the
//! prefetch window, optionally declares the exchange, declares and binds
//! the queue, and starts consuming with a stable consumer tag. Every step
//! is idempotent, so after a transport failure the whole sequence is simply
//! re-run under exponential backoff. The backoff counts consecutive failures
//! and only resets once a delivery arrives, so a subscription that is
//! established and then immediately torn down again still backs off. A
//! parameter conflict on re-declare is fatal and never retried.

use crate::broker::{Broker, Channel, Delivery, DeliveryStream};
use crate::error::{ConsumerError, Result};
use crate::types::SubscriptionConfig;
use futures::Stream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Handle to an established subscription
pub struct SubscriptionManager {
    broker: Arc<dyn Broker>,
    config: SubscriptionConfig,
    channel: Option<Box<dyn Channel>>,
    stream: Option<Box<dyn DeliveryStream>>,
    /// Resolved queue name (broker-generated when configured empty)
    queue: String,
    reconnects: u64,
    /// Consecutive failures since the last delivery
    failures: u32,
    closed: bool,
}

impl SubscriptionManager {
    /// Establish the subscription, retrying transient failures
    ///
    /// Fails with `ConfigurationConflict` on a parameter mismatch,
    /// `ReconnectExhausted` once the retry budget is spent, or `Cancelled`
    /// if `token` fires first.
    pub async fn open(
        broker: Arc<dyn Broker>,
        config: SubscriptionConfig,
        token: &CancellationToken,
    ) -> Result<Self> {
        let mut manager = Self {
            broker,
            queue: config.queue.name.clone(),
            config,
            channel: None,
            stream: None,
            reconnects: 0,
            failures: 0,
            closed: false,
        };
        manager.establish_with_retry(token).await?;
        Ok(manager)
    }

    /// Queue this subscription consumes from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Subscription configuration
    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Number of successful re-establishments after the initial one
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Receive the next delivery, reconnecting transparently on transport failure
    ///
    /// Returns `Ok(None)` once the subscription is closed or `token` is
    /// cancelled while reconnecting.
    pub async fn next_delivery(&mut self, token: &CancellationToken) -> Result<Option<Delivery>> {
        loop {
            if self.closed {
                return Ok(None);
            }

            let received = match self.stream.as_mut() {
                Some(stream) => stream.next().await,
                None => Err(ConsumerError::Transport("no active consumer".to_string())),
            };

            let err = match received {
                Ok(Some(delivery)) => {
                    self.failures = 0;
                    return Ok(Some(delivery));
                }
                Ok(None) => {
                    tracing::warn!(queue = %self.queue, "Consumer cancelled by broker, re-subscribing");
                    ConsumerError::Transport("consumer cancelled by broker".to_string())
                }
                Err(e) if e.is_transport() => {
                    tracing::warn!(queue = %self.queue, error = %e, "Transport failure, reconnecting");
                    e
                }
                Err(e) => return Err(e),
            };

            self.release_channel().await;
            let recovered = match self.back_off(&err, token).await {
                Ok(()) => self.establish_with_retry(token).await,
                Err(e) => Err(e),
            };
            match recovered {
                Ok(()) => self.reconnects += 1,
                Err(ConsumerError::Cancelled) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Report a transport failure seen outside the stream (e.g. a failed ack)
    ///
    /// The channel is closed and discarded; the next call to
    /// [`next_delivery`](Self::next_delivery) reconnects.
    pub async fn invalidate(&mut self) {
        self.release_channel().await;
    }

    /// Turn the subscription into a lazy, infinite stream of deliveries
    ///
    /// The stream ends when `token` is cancelled or a fatal error occurs
    /// (yielded as the final item). It cannot be restarted.
    pub fn into_stream(self, token: CancellationToken) -> impl Stream<Item = Result<Delivery>> + Send {
        futures::stream::unfold(Some(self), move |state| {
            let token = token.clone();
            async move {
                let mut manager = state?;
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => return None,
                    next = manager.next_delivery(&token) => next,
                };
                match next {
                    Ok(Some(delivery)) => Some((Ok(delivery), Some(manager))),
                    Ok(None) => None,
                    Err(e) => Some((Err(e), None)),
                }
            }
        })
    }

    /// Stop consuming and release the channel
    ///
    /// Unacknowledged deliveries return to the queue broker-side. Durable
    /// queues are left in place.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream = None;
        if let Some(mut channel) = self.channel.take() {
            channel.close().await?;
        }
        tracing::info!(queue = %self.queue, "Subscription closed");
        Ok(())
    }

    /// Close the current channel best-effort and forget it
    async fn release_channel(&mut self) {
        self.stream = None;
        if let Some(channel) = self.channel.take() {
            close_quietly(channel, &self.queue).await;
        }
    }

    /// Count a failure and sleep for its backoff delay
    ///
    /// Fails with `ReconnectExhausted` once the policy gives up, or
    /// `Cancelled` if `token` fires during the sleep.
    async fn back_off(&mut self, err: &ConsumerError, token: &CancellationToken) -> Result<()> {
        self.failures += 1;
        let policy = &self.config.reconnect;
        if !policy.allows(self.failures) {
            return Err(ConsumerError::ReconnectExhausted {
                attempts: self.failures,
                last_error: err.to_string(),
            });
        }

        let delay = policy.delay(self.failures - 1);
        tracing::warn!(
            queue = %self.config.queue.name,
            attempt = self.failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Subscription interrupted, backing off"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = token.cancelled() => Err(ConsumerError::Cancelled),
        }
    }

    async fn establish_with_retry(&mut self, token: &CancellationToken) -> Result<()> {
        loop {
            if token.is_cancelled() {
                return Err(ConsumerError::Cancelled);
            }

            let err = match self.establish().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => {
                    tracing::error!(queue = %self.config.queue.name, error = %e, "Subscription setup failed fatally");
                    return Err(e);
                }
                Err(e) => e,
            };

            self.back_off(&err, token).await?;
        }
    }

    async fn establish(&mut self) -> Result<()> {
        let mut channel = self.broker.open_channel().await?;
        match subscribe(channel.as_mut(), &self.config, self.broker.name()).await {
            Ok((queue, stream)) => {
                self.queue = queue;
                self.channel = Some(channel);
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                close_quietly(channel, &self.queue).await;
                Err(e)
            }
        }
    }

}

/// Run the idempotent qos, declare, bind, consume sequence on `channel`
async fn subscribe(
    channel: &mut dyn Channel,
    cfg: &SubscriptionConfig,
    broker: &str,
) -> Result<(String, Box<dyn DeliveryStream>)> {
    if !cfg.consume.auto_ack && cfg.consume.prefetch > 0 {
        channel.set_prefetch(cfg.consume.prefetch).await?;
    }
    if cfg.declare_exchange {
        channel.declare_exchange(&cfg.exchange).await?;
    }

    let queue = channel.declare_queue(&cfg.queue).await?;
    channel
        .bind_queue(&queue, &cfg.exchange.name, &cfg.topic_filter)
        .await?;
    let stream = channel.consume(&queue, &cfg.consume).await?;

    tracing::info!(
        broker,
        queue = %queue,
        filter = %cfg.topic_filter,
        consumer = %cfg.consume.consumer_tag,
        durable = cfg.queue.durable,
        max_length = ?cfg.queue.max_length,
        auto_ack = cfg.consume.auto_ack,
        "Subscription established"
    );
    Ok((queue, stream))
}

async fn close_quietly(mut channel: Box<dyn Channel>, queue: &str) {
    if let Err(e) = channel.close().await {
        tracing::debug!(queue = %queue, error = %e, "Channel close failed");
    }
}
