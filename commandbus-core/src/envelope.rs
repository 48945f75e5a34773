//! JSON wire envelopes exchanged over PGMQ (`spec.md` §6 "Wire formats").
//!
//! These are the only shapes the core assumes about payloads; the `data`
//! and `result_data` fields are opaque to everything downstream of
//! serialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::ErrorKind;

/// Published to `<domain>__commands`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: Uuid,
    pub domain: String,
    pub command_type: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// The outcome tag of a [`ReplyEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyOutcomeTag {
    Success,
    Canceled,
    Failed,
}

/// Structured error detail carried on a FAILED or CANCELED reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Published to a command's `reply_to` queue on terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub command_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub outcome: ReplyOutcomeTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl ReplyEnvelope {
    pub fn success(command_id: Uuid, correlation_id: Option<Uuid>, data: Option<Value>) -> Self {
        Self {
            command_id,
            correlation_id,
            outcome: ReplyOutcomeTag::Success,
            data,
            error: None,
        }
    }

    pub fn canceled(command_id: Uuid, correlation_id: Option<Uuid>, reason: String) -> Self {
        Self {
            command_id,
            correlation_id,
            outcome: ReplyOutcomeTag::Canceled,
            data: None,
            error: Some(ReplyError {
                kind: ErrorKind::Permanent,
                code: "OPERATOR_CANCEL".into(),
                message: "canceled by operator".into(),
                reason: Some(reason),
            }),
        }
    }

    pub fn failed(
        command_id: Uuid,
        correlation_id: Option<Uuid>,
        kind: ErrorKind,
        code: String,
        message: String,
    ) -> Self {
        Self {
            command_id,
            correlation_id,
            outcome: ReplyOutcomeTag::Failed,
            data: None,
            error: Some(ReplyError {
                kind,
                code,
                message,
                reason: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_reply_has_no_error_field() {
        let env = ReplyEnvelope::success(Uuid::nil(), None, Some(serde_json::json!({"ok": true})));
        let v = serde_json::to_value(&env).unwrap();
        assert!(v.get("error").is_none());
        assert_eq!(v["outcome"], "SUCCESS");
    }

    #[test]
    fn canceled_reply_carries_reason() {
        let env = ReplyEnvelope::canceled(Uuid::nil(), None, "duplicate request".into());
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["error"]["reason"], "duplicate request");
        assert_eq!(v["outcome"], "CANCELED");
    }

    #[test]
    fn command_envelope_round_trips() {
        let env = CommandEnvelope {
            command_id: Uuid::now_v7(),
            domain: "payments".into(),
            command_type: "Debit".into(),
            data: serde_json::json!({"amount": 100}),
            reply_to: Some("payments__replies".into()),
            correlation_id: None,
            created_at: Utc::now(),
        };
        let s = serde_json::to_string(&env).unwrap();
        let back: CommandEnvelope = serde_json::from_str(&s).unwrap();
        assert_eq!(back.command_id, env.command_id);
        assert_eq!(back.command_type, "Debit");
    }
}
