use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use univer_event_consumer::broker::amqp::AmqpBroker;
use univer_event_consumer::{handlers, signals, ConsumerConfig, FanoutCoordinator};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match ConsumerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::from(2);
        }
    };

    let broker = Arc::new(AmqpBroker::lazy(config.amqp_config()));
    let subscription = config.subscription_config();
    tracing::info!(
        exchange = %subscription.exchange.name,
        filter = %subscription.topic_filter,
        queue = %subscription.queue.name,
        consumers = config.consumers,
        auto_ack = subscription.consume.auto_ack,
        "Starting univer event consumer"
    );

    let token = CancellationToken::new();
    let signal_task = tokio::spawn(signals::cancel_on_shutdown_signal(token.clone()));

    let coordinator = FanoutCoordinator::new(broker.clone(), Arc::new(handlers::default_router()));
    let result = if config.fans_out() {
        coordinator
            .run(config.consumers, &subscription, token.clone())
            .await
    } else {
        coordinator.run_single(&subscription, token.clone()).await
    };

    token.cancel();
    let _ = signal_task.await;
    if let Err(e) = broker.close().await {
        tracing::debug!(error = %e, "Connection close failed");
    }

    match result {
        Ok(report) => {
            let totals = report.totals();
            tracing::info!(
                received = totals.received,
                handled = totals.handled,
                failed_instances = report.failed(),
                "Shut down cleanly"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "No consumer survived");
            ExitCode::from(1)
        }
    }
}
