//! Process configuration loaded from environment variables

use crate::backoff::ReconnectPolicy;
use crate::broker::amqp::{AmqpConfig, DEFAULT_AMQP_URL};
use crate::error::{ConsumerError, Result};
use crate::topic;
use crate::types::{
    ConsumeOptions, ExchangeOptions, QueueOptions, SubscriptionConfig, EVENT_TYPE_CHANGESET,
    EXCHANGE_NAME,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Settings for the consumer binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerConfig {
    /// AMQP broker URL (`RABBITMQ_URL`)
    #[serde(default = "default_url")]
    pub url: String,

    /// Exchange to bind to (`UNIVER_EXCHANGE`)
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Event type to filter on; `*` subscribes to every type (`UNIVER_EVENT_TYPE`)
    #[serde(default = "default_event_type")]
    pub event_type: String,

    /// Queue name, or base name when fanning out (`UNIVER_QUEUE_BASE`)
    #[serde(default = "default_queue_base")]
    pub queue_base: String,

    /// Number of fan-out consumers (`UNIVER_CONSUMERS`)
    #[serde(default = "default_consumers")]
    pub consumers: usize,

    /// Suffix queue and tag with `-<index>` even for one consumer (`UNIVER_FANOUT`)
    #[serde(default)]
    pub fanout: bool,

    #[serde(default = "default_true")]
    pub durable: bool,

    #[serde(default)]
    pub auto_delete: bool,

    #[serde(default)]
    pub exclusive: bool,

    /// `x-max-length`; 0 leaves the queue unbounded (`UNIVER_MAX_LENGTH`)
    #[serde(default = "default_max_length")]
    pub max_length: u32,

    /// Consumer tag, or tag base when fanning out (`UNIVER_CONSUMER_TAG`)
    #[serde(default = "default_consumer_tag")]
    pub consumer_tag: String,

    #[serde(default)]
    pub auto_ack: bool,

    #[serde(default = "default_prefetch")]
    pub prefetch: u16,

    /// Declare the exchange before binding (`UNIVER_DECLARE_EXCHANGE`)
    #[serde(default)]
    pub declare_exchange: bool,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_url() -> String {
    DEFAULT_AMQP_URL.to_string()
}

fn default_exchange() -> String {
    EXCHANGE_NAME.to_string()
}

fn default_event_type() -> String {
    EVENT_TYPE_CHANGESET.to_string()
}

fn default_queue_base() -> String {
    "univer-event-sync-changeset".to_string()
}

fn default_consumers() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_length() -> u32 {
    100_000
}

fn default_consumer_tag() -> String {
    ConsumeOptions::default().consumer_tag
}

fn default_prefetch() -> u16 {
    ConsumeOptions::default().prefetch
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            exchange: default_exchange(),
            event_type: default_event_type(),
            queue_base: default_queue_base(),
            consumers: default_consumers(),
            fanout: false,
            durable: true,
            auto_delete: false,
            exclusive: false,
            max_length: default_max_length(),
            consumer_tag: default_consumer_tag(),
            auto_ack: false,
            prefetch: default_prefetch(),
            declare_exchange: false,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable lookup
    ///
    /// Unset or empty variables keep their defaults. A value that does not
    /// parse is a configuration error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = get("RABBITMQ_URL") {
            config.url = url;
        }
        if let Some(exchange) = get("UNIVER_EXCHANGE") {
            config.exchange = exchange;
        }
        if let Some(event_type) = get("UNIVER_EVENT_TYPE") {
            config.event_type = event_type;
        }
        if let Some(base) = lookup("UNIVER_QUEUE_BASE") {
            // explicitly empty means broker-named queues
            config.queue_base = base.trim().to_string();
        }
        if let Some(tag) = get("UNIVER_CONSUMER_TAG") {
            config.consumer_tag = tag;
        }

        parse_into(&get, "UNIVER_CONSUMERS", &mut config.consumers)?;
        parse_bool_into(&get, "UNIVER_FANOUT", &mut config.fanout)?;
        parse_bool_into(&get, "UNIVER_DURABLE", &mut config.durable)?;
        parse_bool_into(&get, "UNIVER_AUTO_DELETE", &mut config.auto_delete)?;
        parse_bool_into(&get, "UNIVER_EXCLUSIVE", &mut config.exclusive)?;
        parse_into(&get, "UNIVER_MAX_LENGTH", &mut config.max_length)?;
        parse_bool_into(&get, "UNIVER_AUTO_ACK", &mut config.auto_ack)?;
        parse_into(&get, "UNIVER_PREFETCH", &mut config.prefetch)?;
        parse_bool_into(&get, "UNIVER_DECLARE_EXCHANGE", &mut config.declare_exchange)?;
        parse_into(&get, "UNIVER_RECONNECT_INITIAL_MS", &mut config.reconnect.initial_ms)?;
        parse_into(&get, "UNIVER_RECONNECT_MAX_MS", &mut config.reconnect.max_ms)?;

        if let Some(raw) = get("UNIVER_RECONNECT_MAX_ATTEMPTS") {
            config.reconnect.max_attempts = Some(parse_value("UNIVER_RECONNECT_MAX_ATTEMPTS", &raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that can never work
    pub fn validate(&self) -> Result<()> {
        if self.consumers == 0 {
            return Err(ConsumerError::Config(
                "UNIVER_CONSUMERS must be at least 1".to_string(),
            ));
        }
        if self.exchange.is_empty() {
            return Err(ConsumerError::Config("exchange name must not be empty".to_string()));
        }
        if self.reconnect.initial_ms > self.reconnect.max_ms {
            return Err(ConsumerError::Config(format!(
                "reconnect initial delay {}ms exceeds maximum {}ms",
                self.reconnect.initial_ms, self.reconnect.max_ms
            )));
        }
        if self.reconnect.max_attempts == Some(0) {
            return Err(ConsumerError::Config(
                "UNIVER_RECONNECT_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Base subscription; fan-out instances derive from it
    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            exchange: ExchangeOptions {
                name: self.exchange.clone(),
                ..ExchangeOptions::default()
            },
            queue: QueueOptions {
                name: self.queue_base.clone(),
                durable: self.durable,
                auto_delete: self.auto_delete,
                exclusive: self.exclusive,
                max_length: Some(self.max_length).filter(|n| *n > 0),
            },
            topic_filter: topic::binding_pattern(&self.exchange, &self.event_type),
            consume: ConsumeOptions {
                consumer_tag: self.consumer_tag.clone(),
                auto_ack: self.auto_ack,
                prefetch: self.prefetch,
            },
            declare_exchange: self.declare_exchange,
            reconnect: self.reconnect.clone(),
        }
    }

    /// Whether instances get `-<index>` queue names
    ///
    /// A lone consumer uses `queue_base` verbatim unless fan-out naming is
    /// forced.
    pub fn fans_out(&self) -> bool {
        self.fanout || self.consumers > 1
    }

    pub fn amqp_config(&self) -> AmqpConfig {
        AmqpConfig {
            url: self.url.clone(),
            ..AmqpConfig::default()
        }
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConsumerError::Config(format!("invalid {}='{}': {}", key, raw, e)))
}

fn parse_into<T>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = get(key) {
        *slot = parse_value(key, &raw)?;
    }
    Ok(())
}

fn parse_bool_into(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut bool) -> Result<()> {
    if let Some(raw) = get(key) {
        *slot = match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(ConsumerError::Config(format!(
                    "invalid {}='{}': expected a boolean",
                    key, raw
                )))
            }
        };
    }
    Ok(())
}
