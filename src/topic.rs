//! Topic routing keys and AMQP-style binding patterns
//!
//! Routing keys are dot-separated words: `univer-event-sync.<eventType>`.
//! In binding patterns `*` matches exactly one word and `#` matches zero
//! or more words.

/// Routing key a producer uses for `event_type` on `exchange`
pub fn routing_key(exchange: &str, event_type: &str) -> String {
    format!("{}.{}", exchange, event_type)
}

/// Binding pattern for one event type, or all types when `event_type` is `*`
pub fn binding_pattern(exchange: &str, event_type: &str) -> String {
    routing_key(exchange, event_type)
}

/// Whether `routing_key` matches the topic binding `pattern`
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) if word == "*" || word == k => match_words(rest, key_rest),
            _ => false,
        },
    }
}
