//! `chatrelay-core`: shared building blocks for the chat relay worker.
//!
//! This crate contains **pure** primitives (no broker, no async runtime):
//! identifiers, the inbound event model, the core error type and the backoff
//! calculator used by every retrying component.

pub mod backoff;
pub mod error;
pub mod id;
pub mod message;
pub mod scope;

pub use backoff::Backoff;
pub use error::{CoreError, CoreResult};
pub use id::{MessageId, TenantId, UserId};
pub use message::{InboundEvent, Media};
pub use scope::{ConversationKey, Conversational};
