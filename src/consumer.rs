//! Consume loop for a single subscription
//!
//! Receives deliveries strictly in order, decodes each one, dispatches it
//! through the [`Router`], and settles it with the broker:
//!
//! | Outcome | Manual ack | Auto ack |
//! |---|---|---|
//! | handled / ignored | ack | - |
//! | decode failure | ack (dropped) | - |
//! | handler failure | nack, requeue unless already redelivered | lost |
//!
//! Cancellation is checked between deliveries only; a handler that is
//! already running always completes.

use crate::broker::{Broker, Delivery};
use crate::codec;
use crate::dispatch::{DispatchOutcome, Router};
use crate::error::{ConsumerError, Result};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::subscription::SubscriptionManager;
use crate::types::{DeliveryContext, SubscriptionConfig};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Counters for one consumer run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStats {
    pub received: u64,
    pub handled: u64,
    pub ignored: u64,
    pub decode_failed: u64,
    pub handler_failed: u64,
    pub redelivery_requested: u64,
    pub reconnects: u64,
}

impl ConsumerStats {
    /// Add another run's counters into this one
    pub fn merge(&mut self, other: &ConsumerStats) {
        self.received += other.received;
        self.handled += other.handled;
        self.ignored += other.ignored;
        self.decode_failed += other.decode_failed;
        self.handler_failed += other.handler_failed;
        self.redelivery_requested += other.redelivery_requested;
        self.reconnects += other.reconnects;
    }
}

enum Settlement {
    Ack,
    Nack { requeue: bool },
}

/// A single subscription plus its consume loop
pub struct Consumer {
    broker: Arc<dyn Broker>,
    config: SubscriptionConfig,
    router: Arc<Router>,
    lifecycle: Arc<Lifecycle>,
}

impl Consumer {
    pub fn new(broker: Arc<dyn Broker>, config: SubscriptionConfig, router: Arc<Router>) -> Self {
        Self {
            broker,
            config,
            router,
            lifecycle: Arc::new(Lifecycle::new()),
        }
    }

    /// Observable lifecycle of this consumer
    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Run until `token` is cancelled or a fatal error occurs
    ///
    /// Cancellation yields `Ok` with the counters gathered so far. Only
    /// fatal errors (conflict, exhausted retries) are returned as `Err`.
    pub async fn run(self, token: CancellationToken) -> Result<ConsumerStats> {
        let mut stats = ConsumerStats::default();

        let mut sub = match SubscriptionManager::open(
            self.broker.clone(),
            self.config.clone(),
            &token,
        )
        .await
        {
            Ok(sub) => sub,
            Err(ConsumerError::Cancelled) => {
                self.lifecycle.transition(LifecycleState::Draining)?;
                self.lifecycle.transition(LifecycleState::Stopped)?;
                tracing::info!("Consumer cancelled before it was running");
                return Ok(stats);
            }
            Err(e) => {
                self.lifecycle.stop();
                return Err(e);
            }
        };

        self.lifecycle.transition(LifecycleState::Running)?;
        tracing::info!(queue = %sub.queue(), "Consumer running");

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = sub.next_delivery(&token) => next,
            };

            match next {
                Ok(Some(delivery)) => self.process(&mut sub, delivery, &mut stats).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(queue = %sub.queue(), error = %e, "Consumer failed");
                    stats.reconnects = sub.reconnects();
                    if let Err(close_err) = sub.close().await {
                        tracing::debug!(error = %close_err, "Channel close after failure");
                    }
                    self.lifecycle.stop();
                    return Err(e);
                }
            }
        }

        self.lifecycle.transition(LifecycleState::Draining)?;
        tracing::info!(queue = %sub.queue(), "Consumer draining");

        if let Err(e) = sub.close().await {
            tracing::warn!(queue = %sub.queue(), error = %e, "Failed to close channel cleanly");
        }
        stats.reconnects = sub.reconnects();
        self.lifecycle.transition(LifecycleState::Stopped)?;

        tracing::info!(
            queue = %sub.queue(),
            received = stats.received,
            handled = stats.handled,
            ignored = stats.ignored,
            decode_failed = stats.decode_failed,
            handler_failed = stats.handler_failed,
            reconnects = stats.reconnects,
            "Consumer stopped"
        );
        Ok(stats)
    }

    async fn process(
        &self,
        sub: &mut SubscriptionManager,
        delivery: Delivery,
        stats: &mut ConsumerStats,
    ) {
        stats.received += 1;
        let ctx = DeliveryContext {
            queue: sub.queue().to_string(),
            routing_key: delivery.routing_key.clone(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            trace_id: delivery.trace_id(),
        };

        let envelope = match codec::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    routing_key = %ctx.routing_key,
                    trace_id = ctx.trace_id.as_deref().unwrap_or(""),
                    error = %e,
                    "Dropping undecodable delivery"
                );
                stats.decode_failed += 1;
                self.settle(sub, delivery, Settlement::Ack).await;
                return;
            }
        };

        let span = tracing::debug_span!(
            "dispatch",
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            trace_id = ctx.trace_id.as_deref().unwrap_or(""),
            redelivered = ctx.redelivered,
        );
        let outcome = self.router.dispatch(&envelope, &ctx).instrument(span).await;

        let settlement = match outcome {
            DispatchOutcome::Handled => {
                stats.handled += 1;
                Settlement::Ack
            }
            DispatchOutcome::Ignored => {
                stats.ignored += 1;
                Settlement::Ack
            }
            DispatchOutcome::Failed(_) => {
                stats.handler_failed += 1;
                if !delivery.requires_ack() {
                    tracing::warn!(
                        event_id = %envelope.event_id,
                        "Handler failed in auto-ack mode, event is lost"
                    );
                    return;
                }
                let requeue = !delivery.redelivered;
                if requeue {
                    stats.redelivery_requested += 1;
                } else {
                    tracing::warn!(
                        event_id = %envelope.event_id,
                        "Handler failed on redelivery, dropping event"
                    );
                }
                Settlement::Nack { requeue }
            }
        };

        self.settle(sub, delivery, settlement).await;
    }

    async fn settle(&self, sub: &mut SubscriptionManager, delivery: Delivery, settlement: Settlement) {
        let tag = delivery.delivery_tag;
        let result = match settlement {
            Settlement::Ack => delivery.ack().await,
            Settlement::Nack { requeue } => delivery.nack(requeue).await,
        };
        if let Err(e) = result {
            // Broker redelivers whatever was left unsettled once the channel is gone.
            tracing::warn!(queue = %sub.queue(), delivery_tag = tag, error = %e, "Settle failed");
            if e.is_transport() {
                sub.invalidate().await;
            }
        }
    }
}
