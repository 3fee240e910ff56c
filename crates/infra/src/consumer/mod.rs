//! Consumption: delivery stream, batching, handler dispatch and settlement.

pub mod batching;
pub mod consume;
pub mod delivery;
pub mod dispatcher;

pub use batching::{BatchAssembler, ReadyBatch, combine};
pub use consume::{ConsumerHook, run_consumer};
pub use delivery::{DeliveryAcker, InboundDelivery};
pub use dispatcher::Dispatcher;
