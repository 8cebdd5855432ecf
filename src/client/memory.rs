//! # In-memory clients.
//!
//! [`InMemoryInventory`] and [`MemoryNotifier`] stand in for the remote
//! inventory and the notification transport in demos and tests. Both record
//! every call and support failure injection.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::notify::{Delivery, Notifier, OutboundEvent};
use super::resource::{FieldKey, PowerState, ResourceClient};
use crate::error::ClientError;
use crate::workflow::ResourceRef;

/// One recorded inventory call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Enumerate(String),
    PowerState(ResourceRef),
    GracefulShutdown(ResourceRef),
    ForcePowerOff(ResourceRef),
    SetAnnotation(ResourceRef),
    FindField(String),
    CreateField(String),
}

impl Call {
    /// Whether the call targets a single resource.
    pub fn resource(&self) -> Option<&ResourceRef> {
        match self {
            Call::PowerState(r)
            | Call::GracefulShutdown(r)
            | Call::ForcePowerOff(r)
            | Call::SetAnnotation(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Machine {
    resource: ResourceRef,
    tags: BTreeSet<String>,
    power: PowerState,
    annotations: HashMap<FieldKey, String>,
}

#[derive(Debug, Default)]
struct Inventory {
    machines: Vec<Machine>,
    fields: Vec<(String, FieldKey)>,
    calls: Vec<Call>,
    enumerate_failures: u32,
    fail_power_state: HashSet<ResourceRef>,
    fail_power_off: HashSet<ResourceRef>,
    fail_annotation: HashSet<ResourceRef>,
    deny_field_creation: bool,
}

impl Inventory {
    fn machine_mut(&mut self, r: &ResourceRef) -> Result<&mut Machine, ClientError> {
        self.machines
            .iter_mut()
            .find(|m| &m.resource == r)
            .ok_or_else(|| ClientError::NotFound {
                what: format!("resource {r}"),
            })
    }

    fn field(&self, name: &str) -> Option<FieldKey> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, k)| *k)
    }
}

/// Inventory of virtual machines held in memory.
#[derive(Debug, Default)]
pub struct InMemoryInventory {
    state: Mutex<Inventory>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Adds a virtual machine; inventory order is insertion order.
    pub fn add_vm(&self, id: &str, tags: &[&str], power: PowerState) -> ResourceRef {
        let resource = ResourceRef::vm(id);
        self.lock().machines.push(Machine {
            resource: resource.clone(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            power,
            annotations: HashMap::new(),
        });
        resource
    }

    /// The next `times` enumerations fail with a transport error.
    pub fn fail_enumerate(&self, times: u32) {
        self.lock().enumerate_failures = times;
    }

    pub fn fail_power_state(&self, r: &ResourceRef) {
        self.lock().fail_power_state.insert(r.clone());
    }

    pub fn fail_power_off(&self, r: &ResourceRef) {
        self.lock().fail_power_off.insert(r.clone());
    }

    pub fn fail_annotation(&self, r: &ResourceRef) {
        self.lock().fail_annotation.insert(r.clone());
    }

    /// Field creation is refused (permission denied).
    pub fn deny_field_creation(&self) {
        self.lock().deny_field_creation = true;
    }

    /// Pre-registers a field definition, as if created by another writer.
    pub fn define_field(&self, name: &str) -> FieldKey {
        let mut inv = self.lock();
        if let Some(key) = inv.field(name) {
            return key;
        }
        let key = FieldKey(100 + inv.fields.len() as i32);
        inv.fields.push((name.to_string(), key));
        key
    }

    /// Recorded calls, in arrival order.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls that target a single resource.
    pub fn resource_calls(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.resource().is_some()).count()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn power(&self, r: &ResourceRef) -> Option<PowerState> {
        self.lock()
            .machines
            .iter()
            .find(|m| &m.resource == r)
            .map(|m| m.power)
    }

    /// Value stored under field `name` on `r`.
    pub fn annotation(&self, r: &ResourceRef, name: &str) -> Option<String> {
        let inv = self.lock();
        let key = inv.field(name)?;
        inv.machines
            .iter()
            .find(|m| &m.resource == r)
            .and_then(|m| m.annotations.get(&key).cloned())
    }

    /// Highest number of calls that were in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Inventory> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn remote<R>(&self, call: Call, apply: impl FnOnce(&mut Inventory) -> R) -> R {
        self.lock().calls.push(call);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let out = {
            let mut inv = self.lock();
            apply(&mut *inv)
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[async_trait]
impl ResourceClient for InMemoryInventory {
    async fn enumerate_tagged(&self, tag: &str) -> Result<Vec<ResourceRef>, ClientError> {
        self.remote(Call::Enumerate(tag.to_string()), |inv| {
            if inv.enumerate_failures > 0 {
                inv.enumerate_failures -= 1;
                return Err(ClientError::Transport {
                    reason: "inventory session expired".to_string(),
                });
            }
            Ok(inv
                .machines
                .iter()
                .filter(|m| m.tags.contains(tag))
                .map(|m| m.resource.clone())
                .collect())
        })
        .await
    }

    async fn power_state(&self, r: &ResourceRef) -> Result<PowerState, ClientError> {
        self.remote(Call::PowerState(r.clone()), |inv| {
            if inv.fail_power_state.contains(r) {
                return Err(ClientError::Transport {
                    reason: format!("property collector timeout for {r}"),
                });
            }
            Ok(inv.machine_mut(r)?.power)
        })
        .await
    }

    async fn graceful_shutdown(&self, r: &ResourceRef) -> Result<(), ClientError> {
        self.remote(Call::GracefulShutdown(r.clone()), |inv| {
            let m = inv.machine_mut(r)?;
            if !m.power.is_active() {
                return Err(ClientError::Rejected {
                    reason: format!("{r} is {}", m.power),
                });
            }
            m.power = PowerState::PoweredOff;
            Ok(())
        })
        .await
    }

    async fn force_power_off(&self, r: &ResourceRef) -> Result<(), ClientError> {
        self.remote(Call::ForcePowerOff(r.clone()), |inv| {
            if inv.fail_power_off.contains(r) {
                return Err(ClientError::Rejected {
                    reason: format!("power-off task for {r} failed"),
                });
            }
            let m = inv.machine_mut(r)?;
            m.power = PowerState::PoweredOff;
            Ok(())
        })
        .await
    }

    async fn set_annotation(
        &self,
        r: &ResourceRef,
        key: FieldKey,
        value: &str,
    ) -> Result<(), ClientError> {
        self.remote(Call::SetAnnotation(r.clone()), |inv| {
            if inv.fail_annotation.contains(r) {
                return Err(ClientError::Rejected {
                    reason: format!("set field on {r} denied"),
                });
            }
            if !inv.fields.iter().any(|(_, k)| *k == key) {
                return Err(ClientError::NotFound {
                    what: format!("field {key}"),
                });
            }
            inv.machine_mut(r)?.annotations.insert(key, value.to_string());
            Ok(())
        })
        .await
    }

    async fn find_annotation_field(&self, name: &str) -> Result<Option<FieldKey>, ClientError> {
        self.remote(Call::FindField(name.to_string()), |inv| Ok(inv.field(name)))
            .await
    }

    async fn create_annotation_field(&self, name: &str) -> Result<FieldKey, ClientError> {
        self.remote(Call::CreateField(name.to_string()), |inv| {
            if inv.deny_field_creation {
                return Err(ClientError::Rejected {
                    reason: "permission to define custom fields denied".to_string(),
                });
            }
            if inv.field(name).is_some() {
                return Err(ClientError::AlreadyExists {
                    what: format!("field {name:?}"),
                });
            }
            let key = FieldKey(100 + inv.fields.len() as i32);
            inv.fields.push((name.to_string(), key));
            Ok(key)
        })
        .await
    }
}

#[derive(Debug, Default)]
struct Outbox {
    sent: Vec<(String, OutboundEvent)>,
    nacks: u32,
    transport_failures: u32,
}

/// Notifier that keeps every event it is asked to send.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    outbox: Mutex<Outbox>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` sends are answered with a `Nack`.
    pub fn nack_next(&self, times: u32) {
        self.lock().nacks = times;
    }

    /// The next `times` sends fail before reaching the receiver.
    pub fn fail_next(&self, times: u32) {
        self.lock().transport_failures = times;
    }

    /// Every send attempt as `(target, event)`, acknowledged or not.
    pub fn sent(&self) -> Vec<(String, OutboundEvent)> {
        self.lock().sent.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, event: &OutboundEvent, target: &str) -> Result<Delivery, ClientError> {
        let mut outbox = self.lock();
        outbox.sent.push((target.to_string(), event.clone()));
        if outbox.transport_failures > 0 {
            outbox.transport_failures -= 1;
            return Err(ClientError::Transport {
                reason: format!("connect {target}: connection refused"),
            });
        }
        if outbox.nacks > 0 {
            outbox.nacks -= 1;
            return Ok(Delivery::Nack("receiver answered 503".to_string()));
        }
        Ok(Delivery::Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_field_creates_once() {
        let inv = InMemoryInventory::new();
        let a = inv.ensure_annotation_field("preemption").await.unwrap();
        let b = inv.ensure_annotation_field("preemption").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(inv.count(|c| matches!(c, Call::CreateField(_))), 1);
    }

    #[tokio::test]
    async fn test_ensure_field_reuses_existing_definition() {
        let inv = InMemoryInventory::new();
        let existing = inv.define_field("preemption");

        assert_eq!(inv.ensure_annotation_field("preemption").await.unwrap(), existing);
        assert_eq!(inv.count(|c| matches!(c, Call::CreateField(_))), 0);
    }

    #[tokio::test]
    async fn test_enumerate_keeps_inventory_order() {
        let inv = InMemoryInventory::new();
        let a = inv.add_vm("vm-3", &["batch"], PowerState::PoweredOn);
        inv.add_vm("vm-1", &["web"], PowerState::PoweredOn);
        let c = inv.add_vm("vm-2", &["batch"], PowerState::PoweredOff);

        assert_eq!(inv.enumerate_tagged("batch").await.unwrap(), vec![a, c]);
    }
}
