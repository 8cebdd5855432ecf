//! # Remote resource API.
//!
//! [`ResourceClient`] is everything the pipeline needs from the inventory:
//! tag lookup, power state, the two deactivation modes and custom-field
//! annotations. Implementations must be `Send + Sync`; the stages share one
//! instance through an `Arc`.

use std::fmt;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::workflow::ResourceRef;

/// Power state as reported by the inventory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl PowerState {
    /// Only a powered-on resource can be deactivated.
    #[inline]
    pub fn is_active(self) -> bool {
        self == PowerState::PoweredOn
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
        })
    }
}

/// Key of a custom-field (annotation) definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldKey(pub i32);

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Inventory operations used by the preemption stages.
#[async_trait]
pub trait ResourceClient: Send + Sync + 'static {
    /// Resources carrying `tag`, in inventory order.
    async fn enumerate_tagged(&self, tag: &str) -> Result<Vec<ResourceRef>, ClientError>;

    async fn power_state(&self, resource: &ResourceRef) -> Result<PowerState, ClientError>;

    /// Asks the guest to shut down. Returns once the request is accepted, not
    /// once the guest is off.
    async fn graceful_shutdown(&self, resource: &ResourceRef) -> Result<(), ClientError>;

    /// Hard power-off. Returns once the resource is off.
    async fn force_power_off(&self, resource: &ResourceRef) -> Result<(), ClientError>;

    async fn set_annotation(
        &self,
        resource: &ResourceRef,
        key: FieldKey,
        value: &str,
    ) -> Result<(), ClientError>;

    /// Looks up a field definition by name.
    async fn find_annotation_field(&self, name: &str) -> Result<Option<FieldKey>, ClientError>;

    /// Creates a field definition; fails with [`ClientError::AlreadyExists`] if
    /// another writer got there first.
    async fn create_annotation_field(&self, name: &str) -> Result<FieldKey, ClientError>;

    /// Resolves the field `name`, creating it if missing.
    ///
    /// A concurrent creation (`AlreadyExists`) is resolved by looking the field up again.
    async fn ensure_annotation_field(&self, name: &str) -> Result<FieldKey, ClientError> {
        if let Some(key) = self.find_annotation_field(name).await? {
            return Ok(key);
        }
        match self.create_annotation_field(name).await {
            Ok(key) => Ok(key),
            Err(ClientError::AlreadyExists { what }) => self
                .find_annotation_field(name)
                .await?
                .ok_or(ClientError::NotFound { what }),
            Err(e) => Err(e),
        }
    }
}
