//! Inbound chat event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::id::{MessageId, TenantId, UserId};
use crate::scope::{ConversationKey, Conversational};

/// Media attached to an inbound message (image, audio, document...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// One unit of inbound work as published by the chat gateway.
///
/// Identity is `id`. It is unique per broker delivery, not per logical message:
/// a batched event keeps the id of its newest constituent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub id: MessageId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    pub text: String,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
    /// Ids of every constituent when this event was synthesized from a batch
    /// (empty for a plain delivery).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batched_message_ids: Vec<MessageId>,
}

impl InboundEvent {
    pub fn new(
        id: impl Into<MessageId>,
        user_id: impl Into<UserId>,
        tenant_id: Option<TenantId>,
        text: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            tenant_id,
            text: text.into(),
            received_at,
            media: None,
            batched_message_ids: Vec::new(),
        }
    }

    pub fn with_media(mut self, media: Media) -> Self {
        self.media = Some(media);
        self
    }

    /// Decode a delivery body, rejecting events without usable identity.
    pub fn from_slice(body: &[u8]) -> CoreResult<Self> {
        let event: InboundEvent =
            serde_json::from_slice(body).map_err(|e| CoreError::malformed(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Every message id this event stands for, oldest first.
    pub fn message_ids(&self) -> Vec<MessageId> {
        if self.batched_message_ids.is_empty() {
            vec![self.id.clone()]
        } else {
            self.batched_message_ids.clone()
        }
    }

    pub fn is_batched(&self) -> bool {
        self.batched_message_ids.len() > 1
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(CoreError::validation("event id must not be empty"));
        }
        if self.user_id.as_str().trim().is_empty() {
            return Err(CoreError::validation("userId must not be empty"));
        }
        Ok(())
    }

    pub fn to_vec(&self) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoreError::malformed(e.to_string()))
    }
}

impl Conversational for InboundEvent {
    fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.tenant_id.clone(), self.user_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_gateway_payload() {
        let body = br#"{
            "id": "m-1",
            "userId": "u-1",
            "tenantId": "acme",
            "text": "hello",
            "receivedAt": "2024-05-01T10:00:00Z",
            "media": {"type": "image", "url": "s3://x", "publicUrl": "https://x", "caption": "cat"}
        }"#;

        let event = InboundEvent::from_slice(body).unwrap();
        assert_eq!(event.id.as_str(), "m-1");
        assert_eq!(event.tenant_id, Some(TenantId::new("acme")));
        let media = event.media.unwrap();
        assert_eq!(media.kind, "image");
        assert_eq!(media.public_url.as_deref(), Some("https://x"));
    }

    #[test]
    fn tenant_and_media_are_optional() {
        let body = br#"{"id":"m-2","userId":"u-1","text":"hi","receivedAt":"2024-05-01T10:00:00Z"}"#;
        let event = InboundEvent::from_slice(body).unwrap();
        assert!(event.tenant_id.is_none());
        assert!(event.media.is_none());
    }

    #[test]
    fn rejects_garbage_and_blank_identity() {
        assert!(matches!(
            InboundEvent::from_slice(b"not json"),
            Err(CoreError::MalformedPayload(_))
        ));

        let body = br#"{"id":" ","userId":"u-1","text":"hi","receivedAt":"2024-05-01T10:00:00Z"}"#;
        assert!(matches!(
            InboundEvent::from_slice(body),
            Err(CoreError::Validation(_))
        ));
    }
}
