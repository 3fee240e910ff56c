//! AMQP broker plumbing.
//!
//! - **Connection lifecycle**: [`ConnectionManager`] owns the live session and
//!   drives reconnection with jittered exponential backoff
//! - **Topology**: durable topic exchange, durable inbound queue (optionally
//!   dead-lettered), wildcard binding, prefetch
//! - **Publishing**: persistent JSON messages, one routing key per outbound kind
//! - **Provisioning**: best-effort vhost creation via the management API

pub mod amqp;
pub mod connection;
pub mod publisher;
pub mod vhost;

use serde::Serialize;

pub use amqp::{AmqpConnector, AmqpSession};
pub use connection::{ConnectionManager, Connector, LossNotifier, Session, SessionHook};
pub use publisher::AmqpPublisher;
pub use vhost::provision_vhost;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("topology error: {0}")]
    Topology(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("acknowledgement error: {0}")]
    Ack(String),

    #[error("vhost provisioning error: {0}")]
    Provision(String),

    #[error("not connected")]
    NotConnected,

    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}
