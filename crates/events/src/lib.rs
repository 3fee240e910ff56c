//! Outbound events, the publishing seam and the handler collaborator contract.

pub mod bus;
pub mod handler;
pub mod in_memory_bus;
pub mod outbound;

pub use bus::{EventPublisher, PublishError};
pub use handler::{HandlerError, MessageHandler, Progress, Stage, StageUpdate};
pub use in_memory_bus::InMemoryPublisher;
pub use outbound::{
    DeliveryStatus, ErrorEvent, EventKind, OutboundEvent, ReplyEvent, StatusEvent,
};
