//! # Outbound notification.
//!
//! The notify stage hands a CloudEvents-shaped [`OutboundEvent`] to a
//! [`Notifier`]. Anything other than [`Delivery::Ack`] fails the stage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Event type of the completion notification.
pub const EVENT_TYPE: &str = "com.vmware.workflows.vsphere.VmPreemptedEvent.v0";

/// Content type of the notification payload.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// CloudEvents v1.0 structured-mode event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub specversion: String,
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub time: DateTime<Utc>,
    pub datacontenttype: String,
    pub data: serde_json::Value,
}

impl OutboundEvent {
    /// Builds a `1.0` event with a JSON body.
    pub fn json(
        id: impl Into<String>,
        source: impl Into<String>,
        ty: impl Into<String>,
        time: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            specversion: "1.0".to_string(),
            id: id.into(),
            source: source.into(),
            ty: ty.into(),
            time,
            datacontenttype: JSON_CONTENT_TYPE.to_string(),
            data,
        }
    }
}

/// Transport verdict on one delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Receiver positively acknowledged the event.
    Ack,
    /// Delivered but refused, or the outcome is unknown.
    Nack(String),
}

impl Delivery {
    #[inline]
    pub fn is_ack(&self) -> bool {
        matches!(self, Delivery::Ack)
    }
}

/// Sends notification events to a reply target.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Errors are transport failures (no verdict); a refusal is `Ok(Delivery::Nack)`.
    async fn send(&self, event: &OutboundEvent, target: &str) -> Result<Delivery, ClientError>;
}
