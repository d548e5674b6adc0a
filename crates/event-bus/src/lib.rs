//! Typed event channels for wiring services together.
//!
//! Each event type gets one bounded channel. Publishing never blocks: a
//! full channel drops the event and bumps a counter, so a slow consumer
//! can never stall a producer.

mod event_bus;
mod macros;
mod receiver;

pub use crate::event_bus::{BusEvent, Error, EventBus, DEFAULT_CHANNEL_CAPACITY};
pub use crate::receiver::Receiver;

use std::any::TypeId;

/// Wraps retrieving [`std::any::TypeId`] for type T.
///
/// Use the [`typeid!`] macro for a list.
pub fn tid<T: 'static>() -> TypeId {
    TypeId::of::<T>()
}
