//! Component C: the event fabric.

mod event;
mod fabric;
mod listener;

pub use event::{Event, EventIdAllocator};
pub use fabric::EventFabric;
pub use listener::{Listener, ListenerInterface};
