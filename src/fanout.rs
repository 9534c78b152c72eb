//! Fan-out coordinator: N independent replicas of one subscription
//!
//! Instance `i` consumes from `<queue>-i` with tag `<tag>-i`, all bound
//! with the same topic filter, so every instance receives every matching
//! event. Instances fail independently; the coordinator only fails when
//! none of them survived. [`FanoutCoordinator::run_single`] supervises one
//! consumer on the configured queue name as-is.

use crate::broker::Broker;
use crate::consumer::{Consumer, ConsumerStats};
use crate::dispatch::{panic_message, Router};
use crate::error::{ConsumerError, Result};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::types::SubscriptionConfig;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How one fan-out instance ended
#[derive(Debug)]
pub struct InstanceReport {
    pub index: usize,
    /// Configured queue name (empty for broker-named queues)
    pub queue: String,
    pub outcome: std::result::Result<ConsumerStats, ConsumerError>,
}

impl InstanceReport {
    pub fn is_failed(&self) -> bool {
        self.outcome.is_err()
    }
}

/// Outcome of a coordinator run, ordered by instance index
#[derive(Debug, Default)]
pub struct FanoutReport {
    pub instances: Vec<InstanceReport>,
}

impl FanoutReport {
    /// Number of instances that ended with an error
    pub fn failed(&self) -> usize {
        self.instances.iter().filter(|i| i.is_failed()).count()
    }

    /// Counters summed over every instance that stopped cleanly
    pub fn totals(&self) -> ConsumerStats {
        let mut total = ConsumerStats::default();
        for stats in self.instances.iter().filter_map(|i| i.outcome.as_ref().ok()) {
            total.merge(stats);
        }
        total
    }
}

/// Runs and supervises fan-out consumers over a shared broker connection
pub struct FanoutCoordinator {
    broker: Arc<dyn Broker>,
    router: Arc<Router>,
    lifecycle: Arc<Lifecycle>,
}

impl FanoutCoordinator {
    pub fn new(broker: Arc<dyn Broker>, router: Arc<Router>) -> Self {
        Self {
            broker,
            router,
            lifecycle: Arc::new(Lifecycle::new()),
        }
    }

    /// Observable coordinator lifecycle
    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    /// Run `num_consumers` instances until `token` is cancelled or all have ended
    ///
    /// Returns `Err` when `num_consumers` is zero or when every instance
    /// ended with a fatal error; otherwise the per-instance report.
    pub async fn run(
        &self,
        num_consumers: usize,
        config: &SubscriptionConfig,
        token: CancellationToken,
    ) -> Result<FanoutReport> {
        if num_consumers == 0 {
            self.lifecycle.stop();
            return Err(ConsumerError::Config(
                "number of consumers must be at least 1".to_string(),
            ));
        }
        let instances = (0..num_consumers).map(|i| config.for_instance(i)).collect();
        self.supervise(instances, &config.topic_filter, token).await
    }

    /// Run one consumer on `config` exactly as given
    ///
    /// Queue name and consumer tag are not suffixed, so an existing
    /// fixed-name persistent queue keeps being drained.
    pub async fn run_single(
        &self,
        config: &SubscriptionConfig,
        token: CancellationToken,
    ) -> Result<FanoutReport> {
        self.supervise(vec![config.clone()], &config.topic_filter, token)
            .await
    }

    async fn supervise(
        &self,
        instances: Vec<SubscriptionConfig>,
        filter: &str,
        token: CancellationToken,
    ) -> Result<FanoutReport> {
        let total = instances.len();
        let mut tasks = JoinSet::new();
        for (index, instance) in instances.into_iter().enumerate() {
            let queue = instance.queue.name.clone();
            let consumer = Consumer::new(self.broker.clone(), instance, self.router.clone());
            let child = token.child_token();
            let span = tracing::info_span!("consumer", index, queue = %queue);

            tasks.spawn(
                async move {
                    let outcome = match AssertUnwindSafe(consumer.run(child)).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(panic) => Err(ConsumerError::Panicked(panic_message(&*panic))),
                    };
                    InstanceReport {
                        index,
                        queue,
                        outcome,
                    }
                }
                .instrument(span),
            );
        }

        self.lifecycle.transition(LifecycleState::Running)?;
        tracing::info!(consumers = total, filter = %filter, "Fan-out started");

        let mut report = FanoutReport::default();
        let mut lost = 0;
        let mut draining = false;
        loop {
            tokio::select! {
                _ = token.cancelled(), if !draining => {
                    draining = true;
                    self.lifecycle.transition(LifecycleState::Draining)?;
                    tracing::info!(remaining = tasks.len(), "Draining consumers");
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(instance)) => {
                        if let Err(e) = &instance.outcome {
                            tracing::error!(index = instance.index, error = %e, "Consumer ended with error");
                        }
                        report.instances.push(instance);
                    }
                    Some(Err(e)) => {
                        lost += 1;
                        tracing::error!(error = %e, "Consumer task failed to join");
                    }
                    None => break,
                },
            }
        }
        report.instances.sort_by_key(|i| i.index);
        self.lifecycle.stop();

        if report.failed() + lost < total {
            tracing::info!(failed = report.failed() + lost, "Fan-out stopped");
            return Ok(report);
        }

        let first = report
            .instances
            .into_iter()
            .find_map(|i| i.outcome.err())
            .unwrap_or_else(|| ConsumerError::Transport("all consumer tasks aborted".to_string()));
        Err(first)
    }
}
