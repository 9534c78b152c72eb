//! Memory broker integration tests
//!
//! End-to-end tests running consumers and the fan-out coordinator against
//! the in-memory broker. Covers decoding, dispatch, acknowledgement,
//! bounded queues, fan-out replication, reconnect backoff, and shutdown.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use univer_event_consumer::{
    Broker, ChangeSet, Consumer, ConsumerConfig, ConsumerError, ConsumerStats, DeliveryContext,
    DocKind, Envelope, EventHandler, ExchangeOptions, FanoutCoordinator, Jitter, LifecycleState,
    MemoryBroker, Mutation, QueueOptions, ReconnectPolicy, Router, SubscriptionConfig,
    EXCHANGE_NAME, TRACE_ID_HEADER,
};

type Seen = Arc<Mutex<Vec<(Envelope, DeliveryContext)>>>;

/// Records every envelope it handles; fails the first `fail_first` calls
#[derive(Clone, Default)]
struct Recorder {
    seen: Seen,
    calls: Arc<Mutex<usize>>,
    fail_first: usize,
    delay: Option<Duration>,
}

impl Recorder {
    fn failing(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    fn seen(&self) -> Vec<(Envelope, DeliveryContext)> {
        self.seen.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn event_ids(&self) -> Vec<String> {
        self.seen().into_iter().map(|(e, _)| e.event_id).collect()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(
        &self,
        envelope: &Envelope,
        ctx: &DeliveryContext,
    ) -> univer_event_consumer::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if call <= self.fail_first {
            return Err(ConsumerError::Handler(format!("failure #{}", call)));
        }
        self.seen.lock().unwrap().push((envelope.clone(), ctx.clone()));
        Ok(())
    }
}

fn test_broker() -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.declare_exchange(&ExchangeOptions::default()).unwrap();
    broker
}

fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_ms: 100,
        max_ms: 5_000,
        factor: 2.0,
        jitter: Jitter::None,
        max_attempts: None,
    }
}

fn changeset_config(queue: QueueOptions) -> SubscriptionConfig {
    SubscriptionConfig::for_event_type("changeset", queue).with_reconnect(fast_reconnect())
}

fn sample_changeset(event_id: &str, unit_id: &str, revision: i64) -> Envelope {
    Envelope::changeset(
        event_id,
        ChangeSet {
            unit_id: unit_id.to_string(),
            doc_kind: DocKind::Sheet,
            base_revision: revision - 1,
            revision,
            user_id: "usr1".to_string(),
            member_id: "m1".to_string(),
            mutations: vec![Mutation::new("m1", "ins:A1")],
        },
    )
}

fn publish(broker: &MemoryBroker, envelope: &Envelope) -> usize {
    broker
        .publish_envelope(EXCHANGE_NAME, envelope, HashMap::new())
        .unwrap()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

struct Running {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<univer_event_consumer::Result<ConsumerStats>>,
}

impl Running {
    async fn stop(self) -> ConsumerStats {
        self.token.cancel();
        self.handle.await.unwrap().unwrap()
    }
}

fn spawn_consumer(broker: &MemoryBroker, config: SubscriptionConfig, router: Router) -> Running {
    let token = CancellationToken::new();
    let consumer = Consumer::new(Arc::new(broker.clone()), config, Arc::new(router));
    let handle = tokio::spawn(consumer.run(token.clone()));
    Running { token, handle }
}

// ─── Decode & Dispatch ───────────────────────────────────────────

#[tokio::test]
async fn test_changeset_delivered_to_handler_once() {
    let broker = test_broker();
    let recorder = Recorder::default();
    let running = spawn_consumer(
        &broker,
        changeset_config(QueueOptions::durable("univer-event-sync-changeset", 100_000)),
        Router::new().on("changeset", recorder.clone()),
    );
    wait_until(|| broker.declare_count("univer-event-sync-changeset").is_some()).await;

    let body = br#"{
        "eventId": "e1",
        "eventType": "changeset",
        "csAckEvent": {"cs": {
            "unitID": "u1", "type": 2, "baseRev": 10, "revision": 11,
            "userID": "usr1", "memberID": "m1",
            "mutations": [{"id": "m1", "data": "ins:A1"}]
        }}
    }"#;
    let headers = HashMap::from([(TRACE_ID_HEADER.to_string(), serde_json::json!("trace-42"))]);
    let routed = broker.publish(
        EXCHANGE_NAME,
        "univer-event-sync.changeset",
        body.to_vec(),
        headers,
    );
    assert_eq!(routed, 1);

    wait_until(|| recorder.count() == 1).await;
    let stats = running.stop().await;

    let seen = recorder.seen();
    assert_eq!(seen.len(), 1);
    let (envelope, ctx) = &seen[0];
    let cs = envelope.as_changeset().unwrap();
    assert_eq!(envelope.event_id, "e1");
    assert_eq!(cs.unit_id, "u1");
    assert_eq!(cs.doc_kind, DocKind::Sheet);
    assert_eq!((cs.base_revision, cs.revision), (10, 11));
    assert_eq!(cs.mutations, vec![Mutation::new("m1", "ins:A1")]);
    assert_eq!(ctx.trace_id.as_deref(), Some("trace-42"));
    assert_eq!(ctx.queue, "univer-event-sync-changeset");
    assert_eq!(ctx.routing_key, "univer-event-sync.changeset");

    assert_eq!(stats.handled, 1);
    assert_eq!(broker.unacked_count("univer-event-sync-changeset"), Some(0));
    assert_eq!(broker.queue_depth("univer-event-sync-changeset"), Some(0));
}

#[tokio::test]
async fn test_unknown_event_type_is_acked_silently() {
    let broker = test_broker();
    let recorder = Recorder::default();
    let cfg = SubscriptionConfig::for_event_type("*", QueueOptions::durable("all", 0));
    let running = spawn_consumer(&broker, cfg, Router::new().on("changeset", recorder.clone()));
    wait_until(|| broker.declare_count("all").is_some()).await;

    publish(&broker, &Envelope::untyped("c1", "comment"));
    publish(&broker, &sample_changeset("e1", "u1", 1));

    wait_until(|| recorder.count() == 1 && broker.unacked_count("all") == Some(0)).await;
    let stats = running.stop().await;

    assert_eq!(recorder.event_ids(), vec!["e1"]);
    assert_eq!(stats.ignored, 1);
    assert_eq!(stats.handled, 1);
    assert_eq!(broker.queue_depth("all"), Some(0));
}

#[tokio::test]
async fn test_undecodable_delivery_dropped_and_consumer_continues() {
    let broker = test_broker();
    let recorder = Recorder::default();
    let running = spawn_consumer(
        &broker,
        changeset_config(QueueOptions::durable("q", 0)),
        Router::new().on("changeset", recorder.clone()),
    );
    wait_until(|| broker.declare_count("q").is_some()).await;

    broker.publish(EXCHANGE_NAME, "univer-event-sync.changeset", "{not json", HashMap::new());
    broker.publish(
        EXCHANGE_NAME,
        "univer-event-sync.changeset",
        r#"{"eventId":"bad","eventType":"changeset"}"#,
        HashMap::new(),
    );
    publish(&broker, &sample_changeset("good", "u1", 1));

    wait_until(|| recorder.count() == 1).await;
    let stats = running.stop().await;

    assert_eq!(recorder.event_ids(), vec!["good"]);
    assert_eq!(stats.decode_failed, 2);
    assert_eq!(broker.queue_depth("q"), Some(0));
    assert_eq!(broker.unacked_count("q"), Some(0));
}

#[tokio::test]
async fn test_deliveries_handled_in_publish_order() {
    let broker = test_broker();
    let recorder = Recorder::default();
    let running = spawn_consumer(
        &broker,
        changeset_config(QueueOptions::durable("q", 0)),
        Router::new().on("changeset", recorder.clone()),
    );
    wait_until(|| broker.declare_count("q").is_some()).await;

    for rev in 1..=20 {
        publish(&broker, &sample_changeset(&format!("e{}", rev), "u1", rev));
    }
    wait_until(|| recorder.count() == 20).await;
    running.stop().await;

    let revisions: Vec<i64> = recorder
        .seen()
        .iter()
        .map(|(e, _)| e.as_changeset().unwrap().revision)
        .collect();
    assert_eq!(revisions, (1..=20).collect::<Vec<_>>());
}

// ─── Acknowledgement ─────────────────────────────────────────────

#[tokio::test]
async fn test_handler_failure_causes_exactly_one_redelivery() {
    let broker = test_broker();
    let recorder = Recorder::failing(1);
    let running = spawn_consumer(
        &broker,
        changeset_config(QueueOptions::durable("q", 0)),
        Router::new().on("changeset", recorder.clone()),
    );
    wait_until(|| broker.declare_count("q").is_some()).await;

    publish(&broker, &sample_changeset("e1", "u1", 1));
    wait_until(|| recorder.count() == 1 && broker.unacked_count("q") == Some(0)).await;
    let stats = running.stop().await;

    let seen = recorder.seen();
    assert!(seen[0].1.redelivered);
    assert_eq!(stats.received, 2);
    assert_eq!(stats.handler_failed, 1);
    assert_eq!(stats.redelivery_requested, 1);
    assert_eq!(broker.queue_depth("q"), Some(0));
}

#[tokio::test]
async fn test_auto_ack_loses_failed_event() {
    let broker = test_broker();
    let recorder = Recorder::failing(1);
    let running = spawn_consumer(
        &broker,
        changeset_config(QueueOptions::durable("q", 0)).with_auto_ack(true),
        Router::new().on("changeset", recorder.clone()),
    );
    wait_until(|| broker.declare_count("q").is_some()).await;

    publish(&broker, &sample_changeset("lost", "u1", 1));
    publish(&broker, &sample_changeset("kept", "u1", 2));
    wait_until(|| recorder.count() == 1).await;
    let stats = running.stop().await;

    assert_eq!(recorder.event_ids(), vec!["kept"]);
    assert_eq!(stats.handler_failed, 1);
    assert_eq!(broker.queue_depth("q"), Some(0));
}

#[tokio::test]
async fn test_unacked_prefetch_returns_to_queue_on_shutdown() {
    let broker = test_broker();
    let recorder = Recorder::slow(Duration::from_millis(100));
    let running = spawn_consumer(
        &broker,
        changeset_config(QueueOptions::durable("q", 0)),
        Router::new().on("changeset", recorder.clone()),
    );
    wait_until(|| broker.declare_count("q").is_some()).await;

    publish(&broker, &sample_changeset("e1", "u1", 1));
    publish(&broker, &sample_changeset("e2", "u1", 2));
    wait_until(|| broker.unacked_count("q") == Some(1)).await;

    // Cancel while e1 is mid-handler: it completes, e2 is never started.
    let stats = running.stop().await;
    assert_eq!(recorder.event_ids(), vec!["e1"]);
    assert_eq!(stats.handled, 1);
    assert_eq!(broker.unacked_count("q"), Some(0));
    assert_eq!(broker.queue_depth("q"), Some(1));
    assert_eq!(broker.open_channel_count(), 0);
}

// ─── Bounded Queues ──────────────────────────────────────────────

#[tokio::test]
async fn test_max_length_keeps_most_recent_while_stopped() {
    let broker = test_broker();
    let cfg = changeset_config(QueueOptions::durable("bounded", 3));

    // First run declares and binds the queue, then stops.
    let first = spawn_consumer(&broker, cfg.clone(), Router::new());
    wait_until(|| broker.declare_count("bounded").is_some()).await;
    first.stop().await;

    for rev in 0..4 {
        publish(&broker, &sample_changeset(&format!("e{}", rev), "u1", rev));
    }
    assert_eq!(broker.queue_depth("bounded"), Some(3));
    assert_eq!(broker.evicted_count("bounded"), Some(1));

    let recorder = Recorder::default();
    let second = spawn_consumer(&broker, cfg, Router::new().on("changeset", recorder.clone()));
    wait_until(|| recorder.count() == 3).await;
    second.stop().await;

    assert_eq!(recorder.event_ids(), vec!["e1", "e2", "e3"]);
    assert_eq!(broker.declare_count("bounded"), Some(2));
}

// ─── Single Persistent Consumer ──────────────────────────────────

#[tokio::test]
async fn test_single_consumer_keeps_fixed_queue_across_restarts() {
    let broker = test_broker();
    let vars: HashMap<&str, &str> =
        HashMap::from([("UNIVER_QUEUE_BASE", "univer-event-sync-changeset-persistent")]);
    let config = ConsumerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
    assert!(!config.fans_out());
    let sub = config.subscription_config();

    let recorder = Recorder::default();
    let router = Arc::new(Router::new().on("changeset", recorder.clone()));
    let start = |token: CancellationToken| {
        let coordinator = FanoutCoordinator::new(Arc::new(broker.clone()), router.clone());
        let sub = sub.clone();
        tokio::spawn(async move { coordinator.run_single(&sub, token).await })
    };

    let token = CancellationToken::new();
    let run = start(token.clone());
    wait_until(|| broker.open_channel_count() == 1).await;
    publish(&broker, &sample_changeset("e1", "u1", 1));
    wait_until(|| recorder.count() == 1).await;
    token.cancel();
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.instances[0].queue, "univer-event-sync-changeset-persistent");

    // published while nobody consumes; the restarted consumer drains it
    publish(&broker, &sample_changeset("e2", "u1", 2));
    let token = CancellationToken::new();
    let run = start(token.clone());
    wait_until(|| recorder.count() == 2).await;
    token.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(recorder.event_ids(), vec!["e1", "e2"]);
    assert_eq!(
        broker.queue_names(),
        vec!["univer-event-sync-changeset-persistent".to_string()]
    );
}

// ─── Fan-out ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_fanout_replicates_to_every_instance() {
    let broker = test_broker();
    let recorder = Recorder::default();
    let coordinator = FanoutCoordinator::new(
        Arc::new(broker.clone()),
        Arc::new(Router::new().on("changeset", recorder.clone())),
    );
    let cfg = changeset_config(QueueOptions::durable("fan", 1_000)).with_consumer_tag("myConsumer");
    let token = CancellationToken::new();

    let run = {
        let token = token.clone();
        tokio::spawn(async move { coordinator.run(3, &cfg, token).await })
    };
    wait_until(|| {
        (0..3).all(|i| broker.declare_count(&format!("fan-{}", i)).is_some())
    })
    .await;

    assert_eq!(publish(&broker, &sample_changeset("e1", "u1", 1)), 3);
    wait_until(|| recorder.count() == 3).await;
    token.cancel();
    let report = run.await.unwrap().unwrap();

    let mut queues: Vec<String> = recorder.seen().into_iter().map(|(_, ctx)| ctx.queue).collect();
    queues.sort();
    assert_eq!(queues, vec!["fan-0", "fan-1", "fan-2"]);
    assert!(recorder.event_ids().iter().all(|id| id == "e1"));

    assert_eq!(report.instances.len(), 3);
    assert_eq!(report.failed(), 0);
    assert_eq!(report.totals().handled, 3);
}

#[tokio::test]
async fn test_fanout_with_broker_named_queues() {
    let broker = test_broker();
    let recorder = Recorder::default();
    let coordinator = FanoutCoordinator::new(
        Arc::new(broker.clone()),
        Arc::new(Router::new().on("changeset", recorder.clone())),
    );
    let cfg = changeset_config(QueueOptions::ephemeral());
    let token = CancellationToken::new();

    let run = {
        let token = token.clone();
        tokio::spawn(async move { coordinator.run(2, &cfg, token).await })
    };
    wait_until(|| broker.queue_names().len() == 2).await;
    assert!(broker.queue_names().iter().all(|q| q.starts_with("amq.gen-")));

    assert_eq!(publish(&broker, &sample_changeset("e1", "u1", 1)), 2);
    wait_until(|| recorder.count() == 2).await;
    token.cancel();
    run.await.unwrap().unwrap();

    // auto-delete queues disappear with their consumers
    assert!(broker.queue_names().is_empty());
}

#[tokio::test]
async fn test_fanout_lifecycle_transitions() {
    use futures::StreamExt;

    let broker = test_broker();
    let coordinator = FanoutCoordinator::new(Arc::new(broker.clone()), Arc::new(Router::new()));
    let lifecycle = coordinator.lifecycle();
    let mut states = lifecycle.states();
    let cfg = changeset_config(QueueOptions::durable("lc", 0));
    let token = CancellationToken::new();

    let run = {
        let token = token.clone();
        tokio::spawn(async move { coordinator.run(2, &cfg, token).await })
    };

    assert_eq!(states.next().await, Some(LifecycleState::Starting));
    assert_eq!(states.next().await, Some(LifecycleState::Running));
    token.cancel();
    run.await.unwrap().unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
}

// ─── Failures & Reconnect ────────────────────────────────────────

#[tokio::test]
async fn test_conflicting_redeclare_fails_fast() {
    let broker = test_broker();
    let mut ch = broker.open_channel().await.unwrap();
    ch.declare_queue(&QueueOptions::durable("q-0", 10)).await.unwrap();
    drop(ch);
    let attempts_before = broker.channel_open_attempts().len();

    let coordinator = FanoutCoordinator::new(Arc::new(broker.clone()), Arc::new(Router::new()));
    let cfg = changeset_config(QueueOptions::durable("q", 100_000));
    let err = coordinator
        .run(1, &cfg, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ConsumerError::ConfigurationConflict { .. }));
    assert!(err.is_fatal());
    assert_eq!(broker.channel_open_attempts().len(), attempts_before + 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_drop_reconnects_with_backoff() {
    let broker = test_broker();
    let recorder = Recorder::default();
    let running = spawn_consumer(
        &broker,
        changeset_config(QueueOptions::durable("q", 100)),
        Router::new().on("changeset", recorder.clone()),
    );
    wait_until(|| broker.declare_count("q").is_some()).await;
    publish(&broker, &sample_changeset("before", "u1", 1));
    wait_until(|| recorder.count() == 1).await;

    let attempts_before = broker.channel_open_attempts().len();
    broker.fail_next_channel_opens(3);
    broker.sever();
    publish(&broker, &sample_changeset("after", "u1", 2));

    wait_until(|| recorder.count() == 2).await;
    let stats = running.stop().await;

    assert_eq!(recorder.event_ids(), vec!["before", "after"]);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(broker.declare_count("q"), Some(2));

    let attempts = broker.channel_open_attempts();
    let reconnect_attempts = &attempts[attempts_before..];
    assert_eq!(reconnect_attempts.len(), 4);
    let gaps: Vec<Duration> = reconnect_attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps.windows(2).all(|g| g[1] > g[0]), "gaps not increasing: {:?}", gaps);
    assert!(gaps[0] >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_broker_cancels_back_off() {
    let broker = test_broker();
    broker.cancel_next_consumers(4);
    let recorder = Recorder::default();
    let running = spawn_consumer(
        &broker,
        changeset_config(QueueOptions::durable("q", 100)),
        Router::new().on("changeset", recorder.clone()),
    );

    wait_until(|| broker.channel_open_attempts().len() == 5 && broker.open_channel_count() == 1)
        .await;
    publish(&broker, &sample_changeset("e1", "u1", 1));
    wait_until(|| recorder.count() == 1).await;

    let attempts = broker.channel_open_attempts();
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(800),
        ]
    );
    // every cancelled channel was closed, not abandoned
    assert_eq!(broker.explicit_close_count(), 4);

    let stats = running.stop().await;
    assert_eq!(stats.reconnects, 4);
}

#[tokio::test(start_paused = true)]
async fn test_consumer_starts_before_exchange_exists() {
    let broker = MemoryBroker::new();
    let recorder = Recorder::default();
    let running = spawn_consumer(
        &broker,
        changeset_config(QueueOptions::durable("q", 0)),
        Router::new().on("changeset", recorder.clone()),
    );

    // bind fails with NOT_FOUND until the producer declares the exchange
    wait_until(|| broker.channel_open_attempts().len() >= 2).await;
    broker.declare_exchange(&ExchangeOptions::default()).unwrap();
    wait_until(|| broker.open_channel_count() == 1).await;

    publish(&broker, &sample_changeset("e1", "u1", 1));
    wait_until(|| recorder.count() == 1).await;
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhaustion_is_fatal() {
    let broker = test_broker();
    broker.fail_next_channel_opens(u32::MAX);
    let cfg = changeset_config(QueueOptions::durable("q", 0)).with_reconnect(ReconnectPolicy {
        max_attempts: Some(4),
        ..fast_reconnect()
    });

    let consumer = Consumer::new(Arc::new(broker.clone()), cfg, Arc::new(Router::new()));
    let err = consumer.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ConsumerError::ReconnectExhausted { attempts: 4, .. }));
    assert_eq!(broker.channel_open_attempts().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_returns_promptly() {
    let broker = test_broker();
    broker.fail_next_channel_opens(u32::MAX);
    let cfg = changeset_config(QueueOptions::durable("q", 0)).with_reconnect(ReconnectPolicy {
        initial_ms: 30_000,
        max_ms: 30_000,
        ..fast_reconnect()
    });
    let running = spawn_consumer(&broker, cfg, Router::new());
    wait_until(|| !broker.channel_open_attempts().is_empty()).await;

    let started = tokio::time::Instant::now();
    let stats = running.stop().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(stats.received, 0);
}
