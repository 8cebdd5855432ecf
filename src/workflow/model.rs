//! # Preemption data model.
//!
//! Wire names follow the trigger/status JSON consumed by operators:
//! ```text
//! TriggerRequest  { tag, criticality, event, replyTo }
//! RunState        { workflowID, workflowName, lastRunID, lastPreemptionTime,
//!                   virtualMachines, tag, criticality, event, replyTo }
//! AnnotationRecord{ preempted, tag, forcedShutdown, criticality, runID,
//!                   runStarted, event }
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Urgency of a trigger; the sole input to the deactivation mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Urgency {
    /// Graceful guest shutdown only.
    Low,
    /// Forced power-off.
    Medium,
    /// Forced power-off.
    High,
}

impl Urgency {
    /// Whether resources are powered off hard (`Medium`/`High`) rather than shut down gracefully.
    #[inline]
    pub fn forced(self) -> bool {
        self != Urgency::Low
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::Low => "LOW",
            Urgency::Medium => "MEDIUM",
            Urgency::High => "HIGH",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an [`Urgency`] from text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("urgency {0:?} invalid (valid: LOW, MEDIUM, HIGH)")]
pub struct ParseUrgencyError(pub String);

impl FromStr for Urgency {
    type Err = ParseUrgencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Urgency::Low),
            "MEDIUM" => Ok(Urgency::Medium),
            "HIGH" => Ok(Urgency::High),
            _ => Err(ParseUrgencyError(s.to_string())),
        }
    }
}

/// Opaque, comparable reference to a remote resource (`VirtualMachine:vm-42`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Managed object type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Managed object id.
    #[serde(rename = "value")]
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Shorthand for a `VirtualMachine` reference.
    pub fn vm(id: impl Into<String>) -> Self {
        Self::new("VirtualMachine", id)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// CloudEvents-shaped description of what caused a trigger.
///
/// The loop only reads [`CauseEvent::id`]; everything else is carried through
/// to annotations, notifications and the queryable state untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CauseEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default = "default_specversion")]
    pub specversion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

fn default_specversion() -> String {
    "1.0".to_string()
}

impl Default for CauseEvent {
    fn default() -> Self {
        Self {
            id: String::new(),
            source: String::new(),
            kind: String::new(),
            specversion: default_specversion(),
            time: None,
            datacontenttype: None,
            data: None,
        }
    }
}

impl CauseEvent {
    pub fn new(id: impl Into<String>, source: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Attaches a JSON payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.datacontenttype = Some("application/json".to_string());
        self.data = Some(data);
        self
    }
}

/// A request to run the preemption pipeline. Immutable once received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// Tag identifying candidate resources.
    #[serde(rename = "tag")]
    pub selector_tag: String,
    #[serde(rename = "criticality")]
    pub urgency: Urgency,
    #[serde(rename = "event", default)]
    pub cause_event: CauseEvent,
    /// Notification destination; `None` (or an empty string on the wire) disables notification.
    #[serde(
        rename = "replyTo",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub reply_target: Option<String>,
}

fn empty_as_none<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(de)?;
    Ok(value.filter(|s| !s.is_empty()))
}

impl TriggerRequest {
    pub fn new(selector_tag: impl Into<String>, urgency: Urgency, cause_event: CauseEvent) -> Self {
        Self {
            selector_tag: selector_tag.into(),
            urgency,
            cause_event,
            reply_target: None,
        }
    }

    /// Sets the reply target; an empty string clears it.
    pub fn with_reply_target(mut self, target: impl Into<String>) -> Self {
        let target = target.into();
        self.reply_target = (!target.is_empty()).then_some(target);
        self
    }

    /// The reply target, if one is set and non-empty.
    pub fn reply_target(&self) -> Option<&str> {
        self.reply_target.as_deref().filter(|t| !t.is_empty())
    }
}

/// Identity of one control-loop execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowInfo {
    pub workflow_id: String,
    pub workflow_name: String,
    pub started_at: DateTime<Utc>,
}

/// Queryable outcome of the most recent attempted run.
///
/// Committed by the control loop once per attempted run; never partially updated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(rename = "workflowID")]
    pub workflow_id: String,
    #[serde(rename = "workflowName")]
    pub workflow_name: String,
    #[serde(rename = "lastRunID")]
    pub last_run_id: Option<String>,
    #[serde(rename = "lastPreemptionTime")]
    pub last_run_timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "virtualMachines")]
    pub last_deactivated_set: Vec<ResourceRef>,
    #[serde(rename = "tag")]
    pub selector_tag: String,
    #[serde(rename = "criticality")]
    pub urgency: Option<Urgency>,
    #[serde(rename = "event")]
    pub cause_event: Option<CauseEvent>,
    #[serde(rename = "replyTo")]
    pub reply_target: Option<String>,
}

impl RunState {
    /// State of a loop which has not attempted any run yet.
    pub fn initial(info: &WorkflowInfo) -> Self {
        Self {
            workflow_id: info.workflow_id.clone(),
            workflow_name: info.workflow_name.clone(),
            last_run_id: None,
            last_run_timestamp: None,
            last_deactivated_set: Vec::new(),
            selector_tag: String::new(),
            urgency: None,
            cause_event: None,
            reply_target: None,
        }
    }
}

/// Metadata written to every deactivated resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    #[serde(rename = "preempted")]
    pub deactivated: bool,
    #[serde(rename = "tag")]
    pub selector_tag: String,
    #[serde(rename = "forcedShutdown")]
    pub forced_shutdown: bool,
    #[serde(rename = "criticality")]
    pub urgency: Urgency,
    #[serde(rename = "workflowID")]
    pub workflow_id: String,
    #[serde(rename = "runID")]
    pub run_id: String,
    #[serde(rename = "runStarted")]
    pub run_started_at: DateTime<Utc>,
    #[serde(rename = "event")]
    pub cause_event: CauseEvent,
}

impl AnnotationRecord {
    /// Builds the record for one run; `forced_shutdown` always mirrors `urgency`.
    pub fn for_run(
        req: &TriggerRequest,
        workflow_id: &str,
        run_id: &str,
        run_started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            deactivated: true,
            selector_tag: req.selector_tag.clone(),
            forced_shutdown: req.urgency.forced(),
            urgency: req.urgency,
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            run_started_at,
            cause_event: req.cause_event.clone(),
        }
    }
}

/// Body of the completion notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(flatten)]
    pub annotation: AnnotationRecord,
    #[serde(rename = "virtualMachines")]
    pub resources: Vec<ResourceRef>,
}

impl NotificationPayload {
    /// Unique event id: `{runID}-{causeEventID}`.
    pub fn event_id(&self) -> String {
        format!("{}-{}", self.annotation.run_id, self.annotation.cause_event.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_forced_only_for_medium_and_high() {
        assert!(!Urgency::Low.forced());
        assert!(Urgency::Medium.forced());
        assert!(Urgency::High.forced());
    }

    #[test]
    fn test_urgency_parse_is_case_insensitive() {
        assert_eq!("high".parse::<Urgency>(), Ok(Urgency::High));
        assert_eq!(" Medium ".parse::<Urgency>(), Ok(Urgency::Medium));
        assert!("urgent".parse::<Urgency>().is_err());
    }

    #[test]
    fn test_trigger_request_wire_format() {
        let req: TriggerRequest = serde_json::from_value(json!({
            "tag": "preemptible",
            "criticality": "HIGH",
            "event": {
                "id": "757098cc",
                "source": "preemptctl",
                "type": "ThresholdExceededEvent",
                "specversion": "1.0",
                "data": {"threshold": 70, "current": 87}
            },
            "replyTo": ""
        }))
        .unwrap();

        assert_eq!(req.selector_tag, "preemptible");
        assert_eq!(req.urgency, Urgency::High);
        assert_eq!(req.cause_event.id, "757098cc");
        assert_eq!(req.reply_target(), None);
    }

    #[test]
    fn test_empty_reply_target_is_cleared() {
        let req =
            TriggerRequest::new("t", Urgency::Low, CauseEvent::default()).with_reply_target("");
        assert_eq!(req.reply_target, None);
    }

    #[test]
    fn test_annotation_mirrors_urgency() {
        let started = DateTime::<Utc>::UNIX_EPOCH;
        let low = TriggerRequest::new("t", Urgency::Low, CauseEvent::default());
        let high = TriggerRequest::new("t", Urgency::High, CauseEvent::default());

        assert!(!AnnotationRecord::for_run(&low, "wf", "run", started).forced_shutdown);
        assert!(AnnotationRecord::for_run(&high, "wf", "run", started).forced_shutdown);
    }

    #[test]
    fn test_notification_payload_flattens_annotation() {
        let cause = CauseEvent::new("1", "vc", "Alarm");
        let req = TriggerRequest::new("preemptible", Urgency::High, cause);
        let payload = NotificationPayload {
            annotation: AnnotationRecord::for_run(&req, "wf", "run-1", DateTime::<Utc>::UNIX_EPOCH),
            resources: vec![ResourceRef::vm("vm-42")],
        };

        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["preempted"], json!(true));
        assert_eq!(v["forcedShutdown"], json!(true));
        assert_eq!(v["virtualMachines"][0]["value"], json!("vm-42"));
        assert_eq!(payload.event_id(), "run-1-1");
    }
}
