//! Clients for the outside world: the resource inventory and the notification
//! transport.
//!
//! - [`ResourceClient`] inventory operations (tag lookup, power, annotations)
//! - [`Notifier`] delivery of [`OutboundEvent`]s
//! - [`HttpNotifier`] CloudEvents over HTTP (feature `http`)
//! - [`memory`] in-memory implementations with call recording and failure injection

#[cfg(feature = "http")]
mod http;
pub mod memory;
mod notify;
mod resource;

#[cfg(feature = "http")]
pub use http::HttpNotifier;
pub use notify::{Delivery, EVENT_TYPE, JSON_CONTENT_TYPE, Notifier, OutboundEvent};
pub use resource::{FieldKey, PowerState, ResourceClient};
