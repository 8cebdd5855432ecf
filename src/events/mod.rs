//! Runtime events and the bus that carries them.
//!
//! [`Event`] is a flat record whose populated fields depend on its [`EventKind`];
//! the variant docs list which ones. [`Bus`] broadcasts them to the worker's
//! listener and to any extra receiver.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
