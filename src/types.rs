//! Core types for the univer-event-consumer system
//!
//! Envelope types are the decoded, immutable view of a delivery body. The
//! option structs describe how a subscription is declared on the broker and
//! use camelCase JSON serialization like the rest of the configuration.

use crate::backoff::ReconnectPolicy;
use crate::topic;
use serde::{Deserialize, Serialize};

/// Name of the topic exchange the Univer server publishes to
pub const EXCHANGE_NAME: &str = "univer-event-sync";

/// Event type carried by change-set acknowledgement events
pub const EVENT_TYPE_CHANGESET: &str = "changeset";

/// Message header carrying the producer's trace identifier
pub const TRACE_ID_HEADER: &str = "trace-id";

/// A decoded event envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Producer-assigned event identifier
    pub event_id: String,

    /// Event type tag (e.g., "changeset"); empty when absent on the wire
    pub event_type: String,

    /// Type-specific payload selected by `event_type`
    ///
    /// `changeset` envelopes carry [`Payload::ChangeSet`], every other type
    /// [`Payload::Empty`]; [`codec::encode`](crate::codec::encode) rejects
    /// anything else.
    pub payload: Payload,
}

impl Envelope {
    /// Build a change-set envelope
    pub fn changeset(event_id: impl Into<String>, cs: ChangeSet) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: EVENT_TYPE_CHANGESET.to_string(),
            payload: Payload::ChangeSet(cs),
        }
    }

    /// Build an envelope whose type carries no payload this crate understands
    pub fn untyped(event_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            payload: Payload::Empty,
        }
    }

    /// The change-set payload, if this envelope carries one
    pub fn as_changeset(&self) -> Option<&ChangeSet> {
        match &self.payload {
            Payload::ChangeSet(cs) => Some(cs),
            Payload::Empty => None,
        }
    }
}

/// Envelope payload, tagged by the envelope's event type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// `changeset` events
    ChangeSet(ChangeSet),
    /// Event types without a known payload shape
    Empty,
}

/// Kind of document a change-set applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocKind {
    Doc,
    Sheet,
}

impl DocKind {
    /// Numeric code used on the wire (1: doc, 2: sheet)
    pub fn code(self) -> i64 {
        match self {
            DocKind::Doc => 1,
            DocKind::Sheet => 2,
        }
    }

    /// Parse a wire code
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(DocKind::Doc),
            2 => Some(DocKind::Sheet),
            _ => None,
        }
    }
}

/// A batch of ordered mutations against one unit at a revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub unit_id: String,
    pub doc_kind: DocKind,
    pub base_revision: i64,
    pub revision: i64,
    pub user_id: String,
    pub member_id: String,
    /// Order is significant and preserved from the wire
    pub mutations: Vec<Mutation>,
}

/// An opaque operation within a change-set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub id: String,
    pub data: String,
}

impl Mutation {
    pub fn new(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
        }
    }
}

/// Exchange declaration parameters
///
/// Must match the producer's declaration exactly; the broker rejects a
/// re-declare with different parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeOptions {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            name: EXCHANGE_NAME.to_string(),
            durable: true,
            auto_delete: false,
        }
    }
}

/// Queue declaration parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    /// Queue name; empty lets the broker generate an ephemeral name
    #[serde(default)]
    pub name: String,

    /// Survive broker restarts
    pub durable: bool,

    /// Delete the queue once its last consumer goes away
    pub auto_delete: bool,

    /// Restrict the queue to the declaring connection
    #[serde(default)]
    pub exclusive: bool,

    /// `x-max-length` message cap with FIFO eviction of the oldest message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
}

impl QueueOptions {
    /// Broker-named, non-durable queue removed when the consumer leaves
    pub fn ephemeral() -> Self {
        Self {
            name: String::new(),
            durable: false,
            auto_delete: true,
            exclusive: false,
            max_length: None,
        }
    }

    /// Named durable queue bounded to `max_length` messages
    pub fn durable(name: impl Into<String>, max_length: u32) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            max_length: Some(max_length).filter(|n| *n > 0),
        }
    }
}

/// Parameters for `basic.consume` and flow control
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeOptions {
    /// Stable consumer identity reused across reconnects
    pub consumer_tag: String,

    /// Broker acks on delivery; handler failures then lose the message
    #[serde(default)]
    pub auto_ack: bool,

    /// Maximum unacknowledged deliveries in flight (`basic.qos`); 0 = unlimited
    ///
    /// Provides backpressure: the broker stops pushing once this many
    /// deliveries await acknowledgement. Ignored in auto-ack mode.
    #[serde(default)]
    pub prefetch: u16,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            consumer_tag: "univer-consumer".to_string(),
            auto_ack: false,
            prefetch: 100,
        }
    }
}

/// Everything needed to establish one logical subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConfig {
    pub exchange: ExchangeOptions,
    pub queue: QueueOptions,

    /// Binding pattern, e.g. `univer-event-sync.changeset` or `univer-event-sync.*`
    pub topic_filter: String,

    pub consume: ConsumeOptions,

    /// Declare the exchange defensively before binding
    #[serde(default)]
    pub declare_exchange: bool,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl SubscriptionConfig {
    /// Subscription on the Univer exchange filtered to one event type (or `*`)
    pub fn for_event_type(event_type: &str, queue: QueueOptions) -> Self {
        let exchange = ExchangeOptions::default();
        Self {
            topic_filter: topic::binding_pattern(&exchange.name, event_type),
            exchange,
            queue,
            consume: ConsumeOptions::default(),
            declare_exchange: false,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Set the consumer tag
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consume.consumer_tag = tag.into();
        self
    }

    /// Switch acknowledgement mode
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.consume.auto_ack = auto_ack;
        self
    }

    /// Set the reconnect policy
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Derive the configuration of fan-out instance `index`
    ///
    /// Queue and tag get an `-<index>` suffix; an empty queue name stays
    /// empty so each instance receives its own broker-generated queue.
    pub fn for_instance(&self, index: usize) -> Self {
        let mut cfg = self.clone();
        if !cfg.queue.name.is_empty() {
            cfg.queue.name = format!("{}-{}", self.queue.name, index);
        }
        cfg.consume.consumer_tag = format!("{}-{}", self.consume.consumer_tag, index);
        cfg
    }
}

/// Per-delivery context passed to handlers alongside the envelope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryContext {
    /// Queue the delivery came from
    pub queue: String,
    /// Routing key the producer published with
    pub routing_key: String,
    /// Channel-scoped delivery tag
    pub delivery_tag: u64,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
    /// Value of the `trace-id` header, if present
    pub trace_id: Option<String>,
}
