//! In-memory topic-exchange broker
//!
//! Models the parts of AMQP topic routing the consumer relies on:
//! durable and ephemeral queues, `x-max-length` FIFO eviction, bindings
//! with `*`/`#` patterns, prefetch windows, redelivery of unacked
//! messages when a channel goes away, and parameter-conflict detection on
//! re-declare.
//!
//! Fault injection ([`MemoryBroker::sever`], [`MemoryBroker::restart`],
//! [`MemoryBroker::fail_next_channel_opens`],
//! [`MemoryBroker::cancel_next_consumers`]) makes reconnect behavior
//! testable without a real broker.

use super::{Broker, Channel, Delivery, DeliveryStream};
use crate::codec;
use crate::error::{ConsumerError, Result};
use crate::topic;
use crate::types::{ConsumeOptions, Envelope, ExchangeOptions, QueueOptions};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Message {
    body: Bytes,
    headers: HashMap<String, serde_json::Value>,
    routing_key: String,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Message>,
    /// (channel id, delivery tag) → message awaiting ack
    unacked: BTreeMap<(u64, u64), Message>,
    bindings: Vec<(String, String)>,
    /// Channel ids with an active consumer on this queue
    consumers: HashSet<u64>,
    /// Auto-delete only applies once a queue has had a consumer
    had_consumer: bool,
    declares: u64,
    evicted: u64,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            bindings: Vec::new(),
            consumers: HashSet::new(),
            had_consumer: false,
            declares: 0,
            evicted: 0,
        }
    }

    fn enqueue(&mut self, msg: Message) {
        self.ready.push_back(msg);
        if let Some(max) = self.options.max_length {
            while self.ready.len() > max as usize {
                self.ready.pop_front();
                self.evicted += 1;
            }
        }
    }

    /// Return every unacked message of `channel` to the head of the queue
    fn requeue_channel(&mut self, channel: u64) {
        let keys: Vec<_> = self
            .unacked
            .range((channel, 0)..=(channel, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in keys.into_iter().rev() {
            if let Some(mut msg) = self.unacked.remove(&key) {
                msg.redelivered = true;
                self.ready.push_front(msg);
            }
        }
        self.consumers.remove(&channel);
    }

    fn unacked_for(&self, channel: u64) -> usize {
        self.unacked
            .range((channel, 0)..=(channel, u64::MAX))
            .count()
    }
}

#[derive(Debug, Default)]
struct State {
    /// Bumped on every simulated connection loss
    generation: u64,
    next_channel_id: u64,
    open_channels: HashSet<u64>,
    exchanges: HashMap<String, ExchangeOptions>,
    queues: HashMap<String, QueueState>,
    failing_opens: u32,
    cancelling_consumes: u32,
    open_attempts: Vec<Instant>,
    /// Channels released through `Channel::close` rather than drop
    explicit_closes: u64,
}

impl State {
    fn release_channel(&mut self, channel: u64) {
        if !self.open_channels.remove(&channel) {
            return;
        }
        for q in self.queues.values_mut() {
            q.requeue_channel(channel);
        }
        self.queues
            .retain(|_, q| !(q.options.auto_delete && q.had_consumer && q.consumers.is_empty()));
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker with AMQP topic-exchange semantics
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a raw message, returning the number of queues it was routed to
    ///
    /// Publishing to an undeclared exchange routes nowhere.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Bytes>,
        headers: HashMap<String, serde_json::Value>,
    ) -> usize {
        let body = body.into();
        let mut state = self.shared.lock();
        if !state.exchanges.contains_key(exchange) {
            return 0;
        }

        let mut routed = 0;
        for q in state.queues.values_mut() {
            let bound = q
                .bindings
                .iter()
                .any(|(ex, pattern)| ex == exchange && topic::matches(pattern, routing_key));
            if bound {
                q.enqueue(Message {
                    body: body.clone(),
                    headers: headers.clone(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
                routed += 1;
            }
        }
        drop(state);

        tracing::trace!(exchange, routing_key, routed, "Message published");
        self.shared.notify.notify_waiters();
        routed
    }

    /// Encode and publish an envelope under `<exchange>.<eventType>`
    pub fn publish_envelope(
        &self,
        exchange: &str,
        envelope: &Envelope,
        headers: HashMap<String, serde_json::Value>,
    ) -> Result<usize> {
        let body = codec::encode(envelope)?;
        let key = topic::routing_key(exchange, &envelope.event_type);
        Ok(self.publish(exchange, &key, body, headers))
    }

    /// Declare an exchange from the producer side
    pub fn declare_exchange(&self, opts: &ExchangeOptions) -> Result<()> {
        declare_exchange(&mut self.shared.lock(), opts)
    }

    /// Drop every connection: open streams and channels fail with transport errors
    ///
    /// Unacked messages are requeued as redelivered. Queues survive.
    pub fn sever(&self) {
        let mut state = self.shared.lock();
        state.generation += 1;
        let channels: Vec<u64> = state.open_channels.iter().copied().collect();
        for channel in channels {
            state.release_channel(channel);
        }
        drop(state);
        tracing::debug!("Memory broker connections severed");
        self.shared.notify.notify_waiters();
    }

    /// Simulate a broker restart: sever, then discard non-durable state
    pub fn restart(&self) {
        self.sever();
        let mut state = self.shared.lock();
        state.queues.retain(|_, q| q.options.durable);
        state.exchanges.retain(|_, e| e.durable);
    }

    /// Make the next `n` channel opens fail as if the broker were unreachable
    pub fn fail_next_channel_opens(&self, n: u32) {
        self.shared.lock().failing_opens = n;
    }

    /// Make the next `n` consumers be cancelled by the broker right after `consume`
    pub fn cancel_next_consumers(&self, n: u32) {
        self.shared.lock().cancelling_consumes = n;
    }

    /// Times of every channel-open attempt, successful or not
    pub fn channel_open_attempts(&self) -> Vec<Instant> {
        self.shared.lock().open_attempts.clone()
    }

    /// Number of ready (undelivered) messages in a queue
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Number of unacknowledged messages in a queue
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.unacked.len())
    }

    /// How many times a queue has been declared
    pub fn declare_count(&self, queue: &str) -> Option<u64> {
        self.shared.lock().queues.get(queue).map(|q| q.declares)
    }

    /// Messages dropped by `x-max-length` eviction
    pub fn evicted_count(&self, queue: &str) -> Option<u64> {
        self.shared.lock().queues.get(queue).map(|q| q.evicted)
    }

    /// Names of all existing queues, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of channels currently open
    pub fn open_channel_count(&self) -> usize {
        self.shared.lock().open_channels.len()
    }

    /// Number of `Channel::close` calls
    pub fn explicit_close_count(&self) -> u64 {
        self.shared.lock().explicit_closes
    }
}

fn declare_exchange(state: &mut State, opts: &ExchangeOptions) -> Result<()> {
    match state.exchanges.get(&opts.name) {
        Some(existing) if existing != opts => Err(ConsumerError::ConfigurationConflict {
            resource: format!("exchange '{}'", opts.name),
            reason: format!(
                "declared durable={} auto_delete={}, requested durable={} auto_delete={}",
                existing.durable, existing.auto_delete, opts.durable, opts.auto_delete
            ),
        }),
        Some(_) => Ok(()),
        None => {
            state.exchanges.insert(opts.name.clone(), opts.clone());
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_channel(&self) -> Result<Box<dyn Channel>> {
        let mut state = self.shared.lock();
        state.open_attempts.push(Instant::now());

        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(ConsumerError::Transport(
                "connection refused (memory broker unavailable)".to_string(),
            ));
        }

        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.open_channels.insert(id);

        Ok(Box::new(MemoryChannel {
            shared: self.shared.clone(),
            id,
            generation: state.generation,
            prefetch: 0,
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    generation: u64,
    prefetch: u16,
}

impl MemoryChannel {
    /// Lock state, failing if this channel's connection was severed or closed
    fn live_state(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.shared.lock();
        if state.generation != self.generation || !state.open_channels.contains(&self.id) {
            return Err(ConsumerError::Transport("channel closed".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn set_prefetch(&mut self, prefetch: u16) -> Result<()> {
        self.live_state()?;
        self.prefetch = prefetch;
        Ok(())
    }

    async fn declare_exchange(&mut self, opts: &ExchangeOptions) -> Result<()> {
        let mut state = self.live_state()?;
        declare_exchange(&mut state, opts)
    }

    async fn declare_queue(&mut self, opts: &QueueOptions) -> Result<String> {
        let mut state = self.live_state()?;
        let name = if opts.name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4())
        } else {
            opts.name.clone()
        };

        let requested = QueueOptions {
            name: name.clone(),
            ..opts.clone()
        };
        let queue = state
            .queues
            .entry(name.clone())
            .or_insert_with(|| QueueState::new(requested.clone()));

        if queue.options != requested {
            return Err(ConsumerError::ConfigurationConflict {
                resource: format!("queue '{}'", name),
                reason: format!(
                    "existing declaration {:?} differs from requested {:?}",
                    queue.options, requested
                ),
            });
        }
        queue.declares += 1;
        Ok(name)
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let mut state = self.live_state()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(ConsumerError::Transport(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| ConsumerError::Transport(format!("NOT_FOUND - no queue '{}'", queue)))?;
        let binding = (exchange.to_string(), pattern.to_string());
        if !q.bindings.contains(&binding) {
            q.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(
        &mut self,
        queue: &str,
        opts: &ConsumeOptions,
    ) -> Result<Box<dyn DeliveryStream>> {
        let mut state = self.live_state()?;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| ConsumerError::Transport(format!("NOT_FOUND - no queue '{}'", queue)))?;
        q.consumers.insert(self.id);
        q.had_consumer = true;
        let cancelled = state.cancelling_consumes > 0;
        if cancelled {
            state.cancelling_consumes -= 1;
        }

        Ok(Box::new(MemoryDeliveryStream {
            shared: self.shared.clone(),
            queue: queue.to_string(),
            channel: self.id,
            generation: self.generation,
            auto_ack: opts.auto_ack,
            prefetch: if opts.auto_ack { 0 } else { self.prefetch },
            next_tag: 0,
            cancelled,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        state.explicit_closes += 1;
        if state.generation == self.generation {
            state.release_channel(self.id);
        }
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.generation == self.generation {
            state.release_channel(self.id);
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

struct MemoryDeliveryStream {
    shared: Arc<Shared>,
    queue: String,
    channel: u64,
    generation: u64,
    auto_ack: bool,
    prefetch: u16,
    next_tag: u64,
    /// Broker-side cancel pending
    cancelled: bool,
}

impl MemoryDeliveryStream {
    fn try_next(&mut self) -> Result<Option<Option<Delivery>>> {
        let mut state = self.shared.lock();
        if state.generation != self.generation {
            return Err(ConsumerError::Transport("connection lost".to_string()));
        }
        if self.cancelled || !state.open_channels.contains(&self.channel) {
            return Ok(Some(None));
        }
        let Some(q) = state.queues.get_mut(&self.queue) else {
            return Ok(Some(None));
        };
        if self.prefetch > 0 && q.unacked_for(self.channel) >= self.prefetch as usize {
            return Ok(None);
        }
        let Some(msg) = q.ready.pop_front() else {
            return Ok(None);
        };

        self.next_tag += 1;
        let tag = self.next_tag;

        if self.auto_ack {
            return Ok(Some(Some(Delivery::auto_acked(
                msg.body,
                msg.headers,
                tag,
                msg.redelivered,
                msg.routing_key,
            ))));
        }

        q.unacked.insert((self.channel, tag), msg.clone());
        let key = (self.channel, tag);
        let ack = Settle {
            shared: self.shared.clone(),
            queue: self.queue.clone(),
            key,
            generation: self.generation,
        };
        let nack = ack.clone();

        Ok(Some(Some(Delivery::new(
            msg.body,
            msg.headers,
            tag,
            msg.redelivered,
            msg.routing_key,
            move || Box::pin(async move { ack.settle(None) }),
            move |requeue| Box::pin(async move { nack.settle(Some(requeue)) }),
        ))))
    }
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        let shared = self.shared.clone();
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_next()? {
                return Ok(delivery);
            }
            notified.await;
        }
    }
}

/// Ack/nack handle for one unacked message
#[derive(Clone)]
struct Settle {
    shared: Arc<Shared>,
    queue: String,
    key: (u64, u64),
    generation: u64,
}

impl Settle {
    /// `None` acks; `Some(requeue)` nacks
    fn settle(&self, nack: Option<bool>) -> Result<()> {
        let mut state = self.shared.lock();
        if state.generation != self.generation || !state.open_channels.contains(&self.key.0) {
            return Err(ConsumerError::Ack(format!(
                "channel closed before delivery {} was settled",
                self.key.1
            )));
        }
        if let Some(q) = state.queues.get_mut(&self.queue) {
            if let Some(mut msg) = q.unacked.remove(&self.key) {
                if nack == Some(true) {
                    msg.redelivered = true;
                    q.ready.push_front(msg);
                }
            }
        }
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}
