//! Typed payloads for the known queues.
//!
//! Payloads serialize camelCase so records written by the web tier and the
//! worker agree on field names.

use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::queue::QueueName;
use crate::schema::{FieldDef, FieldKind, PayloadSchema};

/// A payload type bound to exactly one queue.
pub trait JobPayload: Serialize {
    /// Queue this payload is enqueued on.
    const QUEUE: QueueName;

    /// Structural schema enforced at enqueue time.
    fn schema() -> PayloadSchema;
}

/// Single SMS notification to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDeliverPayload {
    pub phone_number: String,
    pub message: String,
}

/// Trip invitation SMS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationSendPayload {
    pub phone_number: String,
    pub message: String,
}

/// One notification fanned out to every going member of a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationBatchPayload {
    pub trip_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_user_id: Option<String>,
}

fn sms_schema() -> PayloadSchema {
    PayloadSchema::new(vec![
        FieldDef::required("phoneNumber", FieldKind::String),
        FieldDef::required("message", FieldKind::String),
    ])
}

impl JobPayload for NotificationDeliverPayload {
    const QUEUE: QueueName = QueueName::NotificationDeliver;

    fn schema() -> PayloadSchema {
        sms_schema()
    }
}

impl JobPayload for InvitationSendPayload {
    const QUEUE: QueueName = QueueName::InvitationSend;

    fn schema() -> PayloadSchema {
        sms_schema()
    }
}

impl JobPayload for NotificationBatchPayload {
    const QUEUE: QueueName = QueueName::NotificationBatch;

    fn schema() -> PayloadSchema {
        PayloadSchema::new(vec![
            FieldDef::required("tripId", FieldKind::String),
            FieldDef::required("type", FieldKind::String),
            FieldDef::required("title", FieldKind::String),
            FieldDef::required("body", FieldKind::String),
            FieldDef::optional("data", FieldKind::Object),
            FieldDef::optional("excludeUserId", FieldKind::String),
        ])
    }
}

/// Record carried on a dead-letter queue for a job that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterPayload {
    pub original_queue: QueueName,
    pub job_id: JobId,
    pub payload: serde_json::Value,
    /// Summary of the final failure.
    pub error: String,
    pub attempts: u32,
    pub dead_lettered_at: u64,
}
