//! Built-in handlers used by the consumer binary

use crate::dispatch::{EventHandler, Router};
use crate::error::{ConsumerError, Result};
use crate::types::{DeliveryContext, Envelope, EVENT_TYPE_CHANGESET};
use async_trait::async_trait;

/// Logs every change-set it receives
#[derive(Debug, Default, Clone)]
pub struct LoggingChangeSetHandler;

#[async_trait]
impl EventHandler for LoggingChangeSetHandler {
    async fn handle(&self, envelope: &Envelope, ctx: &DeliveryContext) -> Result<()> {
        let cs = envelope.as_changeset().ok_or_else(|| {
            ConsumerError::Handler(format!(
                "event {} of type '{}' carries no change-set",
                envelope.event_id, envelope.event_type
            ))
        })?;

        tracing::info!(
            event_id = %envelope.event_id,
            unit_id = %cs.unit_id,
            doc_kind = ?cs.doc_kind,
            base_revision = cs.base_revision,
            revision = cs.revision,
            user_id = %cs.user_id,
            member_id = %cs.member_id,
            mutations = cs.mutations.len(),
            queue = %ctx.queue,
            trace_id = ctx.trace_id.as_deref().unwrap_or(""),
            "Change-set received"
        );
        for mutation in &cs.mutations {
            tracing::debug!(unit_id = %cs.unit_id, mutation_id = %mutation.id, data = %mutation.data, "Mutation");
        }
        Ok(())
    }
}

/// Router with the binary's default handler table
pub fn default_router() -> Router {
    Router::new().on(EVENT_TYPE_CHANGESET, LoggingChangeSetHandler)
}
