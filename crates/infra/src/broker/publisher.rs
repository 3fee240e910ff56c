//! Outbound events over AMQP.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::BasicProperties;
use lapin::types::{AMQPValue, FieldTable, LongString};
use tracing::{debug, instrument};
use uuid::Uuid;

use chatrelay_events::{EventKind, EventPublisher, OutboundEvent, PublishError};

use crate::config::BrokerConfig;

use super::amqp::AmqpConnector;
use super::connection::ConnectionManager;

/// Publishes through whatever session the manager currently holds.
///
/// Fails with [`PublishError::Unavailable`] while disconnected; wrap it in a
/// `ReliablePublisher` to buffer those failures.
pub struct AmqpPublisher {
    manager: Arc<ConnectionManager<AmqpConnector>>,
    config: Arc<BrokerConfig>,
}

impl AmqpPublisher {
    pub fn new(manager: Arc<ConnectionManager<AmqpConnector>>, config: Arc<BrokerConfig>) -> Self {
        Self { manager, config }
    }

    pub fn routing_key(&self, kind: EventKind) -> &str {
        routing_key_for(&self.config, kind)
    }
}

pub(crate) fn routing_key_for(config: &BrokerConfig, kind: EventKind) -> &str {
    match kind {
        EventKind::Reply => &config.reply_routing_key,
        EventKind::Error => &config.error_routing_key,
        EventKind::Status => &config.status_routing_key,
    }
}

#[async_trait]
impl EventPublisher for AmqpPublisher {
    #[instrument(skip(self, event), fields(kind = %event.kind(), user_id = %event.user_id()))]
    async fn publish(&self, event: &OutboundEvent) -> Result<(), PublishError> {
        let payload = event
            .to_vec()
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        let session = self
            .manager
            .session()
            .ok_or_else(|| PublishError::Unavailable("broker not connected".to_string()))?;

        let routing_key = self.routing_key(event.kind());
        let properties = BasicProperties::default()
            .with_message_id(Uuid::now_v7().to_string().into())
            .with_headers(kind_headers(event.kind()));

        let confirmation = session
            .publish(routing_key, &payload, properties)
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;
        if confirmation.is_nack() {
            return Err(PublishError::Rejected(format!("broker nacked publish to {routing_key}")));
        }

        debug!(routing_key, bytes = payload.len(), "event published");
        Ok(())
    }
}

/// Event kind as a message header, for consumers bound with a wildcard.
fn kind_headers(kind: EventKind) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        "x-event-kind".into(),
        AMQPValue::LongString(LongString::from(kind.as_str().to_string())),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_kind_has_its_own_routing_key() {
        let cfg = BrokerConfig::default();
        assert_eq!(routing_key_for(&cfg, EventKind::Reply), "outbound.reply");
        assert_eq!(routing_key_for(&cfg, EventKind::Error), "outbound.error");
        assert_eq!(routing_key_for(&cfg, EventKind::Status), "outbound.status");
    }

    #[test]
    fn kind_travels_as_a_header() {
        let headers = kind_headers(EventKind::Status);
        assert_eq!(
            headers.inner().get(&lapin::types::ShortString::from("x-event-kind")),
            Some(&AMQPValue::LongString(LongString::from("status".to_string())))
        );
    }
}
