//! Outbound event payloads (worker -> chat gateway).
//!
//! Each kind is published under its own routing key. Payloads are plain JSON
//! objects; the kind travels in the routing key, not in the body.

use core::fmt;

use serde::{Deserialize, Serialize};

use chatrelay_core::{MessageId, TenantId, UserId};

/// Outbound event kind; selects the routing key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Reply,
    Error,
    Status,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Reply => "reply",
            EventKind::Error => "error",
            EventKind::Status => "status",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply text for a user, covering every message of the burst it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    pub user_id: UserId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batched_message_ids: Option<Vec<MessageId>>,
}

/// Processing failure notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    pub user_id: UserId,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batched_message_ids: Option<Vec<MessageId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_retry: Option<bool>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Processing,
    Completed,
    Failed,
}

/// Processing status of one or more inbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    pub user_id: UserId,
    pub message_ids: Vec<MessageId>,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Reply(ReplyEvent),
    Error(ErrorEvent),
    Status(StatusEvent),
}

impl OutboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            OutboundEvent::Reply(_) => EventKind::Reply,
            OutboundEvent::Error(_) => EventKind::Error,
            OutboundEvent::Status(_) => EventKind::Status,
        }
    }

    pub fn user_id(&self) -> &UserId {
        match self {
            OutboundEvent::Reply(e) => &e.user_id,
            OutboundEvent::Error(e) => &e.user_id,
            OutboundEvent::Status(e) => &e.user_id,
        }
    }

    /// JSON body as published on the wire.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            OutboundEvent::Reply(e) => serde_json::to_vec(e),
            OutboundEvent::Error(e) => serde_json::to_vec(e),
            OutboundEvent::Status(e) => serde_json::to_vec(e),
        }
    }

    pub fn status(
        tenant_id: Option<TenantId>,
        user_id: UserId,
        message_ids: Vec<MessageId>,
        status: DeliveryStatus,
        error_message: Option<String>,
    ) -> Self {
        OutboundEvent::Status(StatusEvent {
            tenant_id,
            user_id,
            message_ids,
            status,
            error_message,
        })
    }
}

impl From<ReplyEvent> for OutboundEvent {
    fn from(value: ReplyEvent) -> Self {
        OutboundEvent::Reply(value)
    }
}

impl From<ErrorEvent> for OutboundEvent {
    fn from(value: ErrorEvent) -> Self {
        OutboundEvent::Error(value)
    }
}

impl From<StatusEvent> for OutboundEvent {
    fn from(value: StatusEvent) -> Self {
        OutboundEvent::Status(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_serializes_camel_case_without_empty_fields() {
        let event = OutboundEvent::Reply(ReplyEvent {
            tenant_id: None,
            user_id: UserId::new("u-1"),
            text: "hi".to_string(),
            guidance: None,
            message_id: Some(MessageId::new("m-3")),
            batched_message_ids: Some(vec![MessageId::new("m-2"), MessageId::new("m-3")]),
        });

        let json: serde_json::Value = serde_json::from_slice(&event.to_vec().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "userId": "u-1",
                "text": "hi",
                "messageId": "m-3",
                "batchedMessageIds": ["m-2", "m-3"],
            })
        );
        assert_eq!(event.kind(), EventKind::Reply);
    }

    #[test]
    fn status_uses_snake_case_values() {
        let event = OutboundEvent::status(
            Some(TenantId::new("acme")),
            UserId::new("u-1"),
            vec![MessageId::new("m-1")],
            DeliveryStatus::Processing,
            None,
        );
        let json: serde_json::Value = serde_json::from_slice(&event.to_vec().unwrap()).unwrap();
        assert_eq!(json["status"], "processing");
        assert_eq!(json["tenantId"], "acme");
        assert_eq!(json["messageIds"], serde_json::json!(["m-1"]));
    }
}
