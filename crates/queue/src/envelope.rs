//! Envelope for a promoted job: the unit appended to the delivery stream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use relayq_core::{JobId, JobPayload};

/// Stream field carrying the JSON-encoded envelope.
pub const WIRE_FIELD: &str = "job";

/// A job as it travels through the delivery stream.
///
/// The canonical wire shape is a single `job` field whose value is this
/// struct as a JSON object: `job_id`, `scheduled_time` and `processed_time`
/// at the top level with all producer-supplied payload fields merged in
/// beside them.
///
/// Notes:
/// - `scheduled_time` is the due time the producer asked for (the index
///   score at promotion).
/// - `processed_time` is stamped by the promoter when the job is moved.
/// - Entries are append-only and immutable; they are never edited, only
///   acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(default)]
    pub job_id: JobId,

    /// Due time the job was scheduled for (epoch seconds).
    #[serde(default)]
    pub scheduled_time: i64,

    /// When the promoter moved the job into the stream (epoch seconds).
    #[serde(default)]
    pub processed_time: i64,

    /// Producer-defined fields, merged at the top level on the wire.
    #[serde(flatten)]
    pub payload: JobPayload,
}

impl JobEnvelope {
    pub fn new(job_id: JobId, scheduled_time: i64, processed_time: i64, payload: JobPayload) -> Self {
        Self {
            job_id,
            scheduled_time,
            processed_time,
            payload,
        }
    }

    /// Serialize to the canonical `job`-field JSON string.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Canonical stream fields for this envelope: a single `job` field.
    pub fn to_fields(&self) -> Result<BTreeMap<String, String>, serde_json::Error> {
        let mut fields = BTreeMap::new();
        fields.insert(WIRE_FIELD.to_string(), self.encode()?);
        Ok(fields)
    }

    /// Decode a stream entry's fields into an envelope.
    ///
    /// Accepts both wire shapes: the canonical single `job` JSON field, and
    /// the legacy flat field map. A `job` field that fails to decode falls
    /// back to treating the raw fields as the job, so a malformed entry is
    /// still deliverable for inspection rather than poisoning the reader.
    pub fn decode(fields: &BTreeMap<String, String>) -> Self {
        if let Some(raw) = fields.get(WIRE_FIELD) {
            match serde_json::from_str::<Self>(raw) {
                Ok(envelope) => return envelope,
                Err(err) => {
                    warn!(error = %err, "failed to decode job JSON; falling back to raw fields");
                }
            }
        }
        Self::from_flat(fields)
    }

    /// Build an envelope from a legacy flat field map.
    fn from_flat(fields: &BTreeMap<String, String>) -> Self {
        let job_id = fields
            .get("job_id")
            .map(|s| JobId::new(s.clone()))
            .unwrap_or_default();
        let scheduled_time = fields
            .get("scheduled_time")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let processed_time = fields
            .get("processed_time")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let payload = fields
            .iter()
            .filter(|(k, _)| {
                !matches!(k.as_str(), "job_id" | "scheduled_time" | "processed_time")
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            job_id,
            scheduled_time,
            processed_time,
            payload,
        }
    }
}
