//! # univer-event-consumer
//!
//! Reliable fan-out consumer for change-set events published by the Univer
//! server to the `univer-event-sync` topic exchange.
//!
//! ## Overview
//!
//! Each subscription declares a durable, bounded queue, binds it with a
//! topic filter, and consumes with manual acknowledgement. Deliveries are
//! decoded into typed [`Envelope`]s and dispatched through a [`Router`] of
//! per-event-type handlers. Transport failures reconnect with exponential
//! backoff; a declaration conflict ends the affected subscription.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use univer_event_consumer::broker::memory::MemoryBroker;
//! use univer_event_consumer::dispatch::handler_fn;
//! use univer_event_consumer::{
//!     ExchangeOptions, FanoutCoordinator, QueueOptions, Router, SubscriptionConfig,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> univer_event_consumer::Result<()> {
//! let broker = MemoryBroker::new();
//! broker.declare_exchange(&ExchangeOptions::default())?;
//!
//! let router = Router::new().on(
//!     "changeset",
//!     handler_fn(|env, _ctx| {
//!         let unit = env.as_changeset().map(|cs| cs.unit_id.clone());
//!         Box::pin(async move {
//!             println!("change-set for {:?}", unit);
//!             Ok(())
//!         })
//!     }),
//! );
//!
//! let config = SubscriptionConfig::for_event_type(
//!     "changeset",
//!     QueueOptions::durable("univer-event-sync-changeset", 100_000),
//! );
//! let token = CancellationToken::new();
//! let coordinator = FanoutCoordinator::new(Arc::new(broker), Arc::new(router));
//! let report = coordinator.run(3, &config, token).await?;
//! println!("{} instances failed", report.failed());
//! # Ok(())
//! # }
//! ```
//!
//! ## Brokers
//!
//! - **amqp**: RabbitMQ over AMQP 0-9-1 via `lapin`
//! - **memory**: In-process topic exchange for tests, with fault injection
//!
//! ## Architecture
//!
//! - **Broker / Channel / DeliveryStream** traits: the seam every backend implements
//! - **SubscriptionManager**: idempotent declare-bind-consume with reconnect
//! - **Consumer**: ordered decode, dispatch, and acknowledgement loop
//! - **FanoutCoordinator**: N replicated consumers under one cancellation token
//! - **Lifecycle**: observable `Starting → Running → Draining → Stopped`

pub mod backoff;
pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod lifecycle;
pub mod signals;
pub mod subscription;
pub mod topic;
pub mod types;

// Re-export core types
pub use backoff::{Jitter, ReconnectPolicy};
pub use broker::{Broker, Channel, Delivery, DeliveryStream};
pub use config::ConsumerConfig;
pub use consumer::{Consumer, ConsumerStats};
pub use dispatch::{DispatchOutcome, EventHandler, Router};
pub use error::{ConsumerError, DecodeError, Result};
pub use fanout::{FanoutCoordinator, FanoutReport, InstanceReport};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use subscription::SubscriptionManager;
pub use types::{
    ChangeSet, ConsumeOptions, DeliveryContext, DocKind, Envelope, ExchangeOptions, Mutation,
    Payload, QueueOptions, SubscriptionConfig, EVENT_TYPE_CHANGESET, EXCHANGE_NAME,
    TRACE_ID_HEADER,
};

// Re-export brokers for convenience
pub use broker::amqp::{AmqpBroker, AmqpConfig};
pub use broker::memory::MemoryBroker;
