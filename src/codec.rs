//! Envelope codec: JSON wire format ⇄ [`Envelope`]
//!
//! Wire shape produced by the Univer server:
//!
//! ```json
//! {
//!   "eventId": "e1",
//!   "eventType": "changeset",
//!   "csAckEvent": {
//!     "cs": {
//!       "unitID": "u1", "type": 2, "baseRev": 10, "revision": 11,
//!       "userID": "usr1", "memberID": "m1",
//!       "mutations": [{ "id": "m1", "data": "ins:A1" }]
//!     }
//!   }
//! }
//! ```
//!
//! Unknown fields are ignored. `csAckEvent` is only inspected for
//! `changeset` envelopes, so new event types never fail to decode.

use crate::error::DecodeError;
use crate::types::{ChangeSet, DocKind, Envelope, Mutation, Payload, EVENT_TYPE_CHANGESET};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelopeIn {
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    cs_ack_event: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelopeOut<'a> {
    event_id: &'a str,
    event_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cs_ack_event: Option<WireCsAckEvent<'a>>,
}

#[derive(Serialize)]
struct WireCsAckEvent<'a> {
    cs: WireChangeSet<'a>,
}

#[derive(Serialize)]
struct WireChangeSet<'a> {
    #[serde(rename = "unitID")]
    unit_id: &'a str,
    #[serde(rename = "type")]
    kind: i64,
    #[serde(rename = "baseRev")]
    base_rev: i64,
    revision: i64,
    #[serde(rename = "userID")]
    user_id: &'a str,
    #[serde(rename = "memberID")]
    member_id: &'a str,
    mutations: &'a [Mutation],
}

/// Decode a delivery body into an envelope
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let len = bytes.len();
    let wire: WireEnvelopeIn =
        serde_json::from_slice(bytes).map_err(|source| DecodeError::Malformed { len, source })?;

    let payload = if wire.event_type == EVENT_TYPE_CHANGESET {
        let value = wire
            .cs_ack_event
            .filter(|v| !v.is_null())
            .ok_or_else(|| DecodeError::MissingPayload {
                len,
                event_type: wire.event_type.clone(),
            })?;
        Payload::ChangeSet(decode_changeset(value, len)?)
    } else {
        Payload::Empty
    };

    Ok(Envelope {
        event_id: wire.event_id,
        event_type: wire.event_type,
        payload,
    })
}

fn decode_changeset(value: serde_json::Value, len: usize) -> Result<ChangeSet, DecodeError> {
    #[derive(Deserialize)]
    struct Owned {
        cs: OwnedChangeSet,
    }

    #[derive(Deserialize)]
    struct OwnedChangeSet {
        #[serde(rename = "unitID", default)]
        unit_id: String,
        #[serde(rename = "type")]
        kind: i64,
        #[serde(rename = "baseRev", default)]
        base_rev: i64,
        #[serde(default)]
        revision: i64,
        #[serde(rename = "userID", default)]
        user_id: String,
        #[serde(rename = "memberID", default)]
        member_id: String,
        #[serde(default)]
        mutations: Vec<Mutation>,
    }

    let owned: Owned =
        serde_json::from_value(value).map_err(|source| DecodeError::Malformed { len, source })?;
    let cs = owned.cs;
    let doc_kind =
        DocKind::from_code(cs.kind).ok_or(DecodeError::UnknownDocKind { len, kind: cs.kind })?;

    Ok(ChangeSet {
        unit_id: cs.unit_id,
        doc_kind,
        base_revision: cs.base_rev,
        revision: cs.revision,
        user_id: cs.user_id,
        member_id: cs.member_id,
        mutations: cs.mutations,
    })
}

/// Encode an envelope into the wire format
///
/// Used by the in-memory broker's publisher and by tests; this crate never
/// publishes to a production exchange. Fails if `event_type` and payload
/// disagree, since [`decode`] could not read the result back.
pub fn encode(envelope: &Envelope) -> serde_json::Result<Vec<u8>> {
    let is_changeset = envelope.event_type == EVENT_TYPE_CHANGESET;
    if is_changeset != matches!(envelope.payload, Payload::ChangeSet(_)) {
        return Err(serde::ser::Error::custom(format!(
            "envelope '{}' of type '{}' carries a mismatched payload",
            envelope.event_id, envelope.event_type
        )));
    }

    let cs_ack_event = match &envelope.payload {
        Payload::ChangeSet(cs) => Some(WireCsAckEvent {
            cs: WireChangeSet {
                unit_id: &cs.unit_id,
                kind: cs.doc_kind.code(),
                base_rev: cs.base_revision,
                revision: cs.revision,
                user_id: &cs.user_id,
                member_id: &cs.member_id,
                mutations: &cs.mutations,
            },
        }),
        Payload::Empty => None,
    };

    let wire = WireEnvelopeOut {
        event_id: &envelope.event_id,
        event_type: &envelope.event_type,
        cs_ack_event,
    };

    serde_json::to_vec(&wire)
}
