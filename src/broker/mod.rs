//! Broker abstraction: the seam between the consumer core and a message broker
//!
//! A [`Broker`] is the shared connection: it is only ever used to open
//! channels. Each subscription owns one [`Channel`] exclusively and reads
//! from the [`DeliveryStream`] it produces.

use crate::error::Result;
use crate::types::{ConsumeOptions, ExchangeOptions, QueueOptions, TRACE_ID_HEADER};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;

pub mod amqp;
pub mod memory;

/// Shared broker connection
///
/// Implementations must allow concurrent channel creation from many tasks.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new channel, reconnecting the underlying connection if needed
    async fn open_channel(&self) -> Result<Box<dyn Channel>>;

    /// Broker name (e.g., "amqp", "memory")
    fn name(&self) -> &str;
}

/// A single channel, owned by exactly one subscription task
#[async_trait]
pub trait Channel: Send {
    /// Limit unacknowledged deliveries in flight; 0 = unlimited
    async fn set_prefetch(&mut self, prefetch: u16) -> Result<()>;

    /// Declare a topic exchange; identical re-declares are no-ops
    async fn declare_exchange(&mut self, opts: &ExchangeOptions) -> Result<()>;

    /// Declare a queue, returning its (possibly broker-generated) name
    ///
    /// Re-declaring an existing queue with different parameters fails with
    /// `ConsumerError::ConfigurationConflict`.
    async fn declare_queue(&mut self, opts: &QueueOptions) -> Result<String>;

    /// Bind `queue` to `exchange` with a topic pattern
    async fn bind_queue(&mut self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Start consuming `queue`
    async fn consume(
        &mut self,
        queue: &str,
        opts: &ConsumeOptions,
    ) -> Result<Box<dyn DeliveryStream>>;

    /// Close the channel; unacknowledged deliveries return to their queue
    async fn close(&mut self) -> Result<()>;
}

/// Stream of deliveries from one consumer
#[async_trait]
pub trait DeliveryStream: Send {
    /// Wait for the next delivery
    ///
    /// `Ok(None)` means the broker cancelled the consumer or the channel was
    /// closed cleanly; `Err` means the transport failed.
    async fn next(&mut self) -> Result<Option<Delivery>>;
}

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
type NackFn = Box<dyn FnOnce(bool) -> BoxFuture<'static, Result<()>> + Send>;

/// A raw message received from the broker
pub struct Delivery {
    /// Message body
    pub body: Bytes,

    /// Message headers
    pub headers: HashMap<String, serde_json::Value>,

    /// Channel-scoped delivery tag
    pub delivery_tag: u64,

    /// Whether the broker delivered this message before
    pub redelivered: bool,

    /// Routing key the message was published with
    pub routing_key: String,

    ack_fn: Option<AckFn>,
    nack_fn: Option<NackFn>,
}

impl Delivery {
    /// Create a delivery that must be acknowledged through the given callbacks
    pub fn new(
        body: Bytes,
        headers: HashMap<String, serde_json::Value>,
        delivery_tag: u64,
        redelivered: bool,
        routing_key: String,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nack_fn: impl FnOnce(bool) -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            body,
            headers,
            delivery_tag,
            redelivered,
            routing_key,
            ack_fn: Some(Box::new(ack_fn)),
            nack_fn: Some(Box::new(nack_fn)),
        }
    }

    /// Create a delivery the broker already acknowledged (auto-ack mode)
    pub fn auto_acked(
        body: Bytes,
        headers: HashMap<String, serde_json::Value>,
        delivery_tag: u64,
        redelivered: bool,
        routing_key: String,
    ) -> Self {
        Self {
            body,
            headers,
            delivery_tag,
            redelivered,
            routing_key,
            ack_fn: None,
            nack_fn: None,
        }
    }

    /// Whether this delivery still needs an explicit ack or nack
    pub fn requires_ack(&self) -> bool {
        self.ack_fn.is_some()
    }

    /// The `trace-id` header as a string, if present
    pub fn trace_id(&self) -> Option<String> {
        self.headers.get(TRACE_ID_HEADER).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Acknowledge successful processing; no-op in auto-ack mode
    pub async fn ack(mut self) -> Result<()> {
        match self.ack_fn.take() {
            Some(ack) => ack().await,
            None => Ok(()),
        }
    }

    /// Reject the delivery, optionally asking for redelivery; no-op in auto-ack mode
    pub async fn nack(mut self, requeue: bool) -> Result<()> {
        match self.nack_fn.take() {
            Some(nack) => nack(requeue).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("requires_ack", &self.requires_ack())
            .finish()
    }
}
