use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionKind, FaultKind};
use crate::{new_signal_id, SignalError};

/// Structured parameter bag carried by events and actions.
/// BTreeMap keeps key order stable so equality and serialization are deterministic.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Event type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    FuncCall,
    FuncReturn,
    Message,
    Log,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::FuncCall => "FuncCall",
            EventKind::FuncReturn => "FuncReturn",
            EventKind::Message => "Message",
            EventKind::Log => "Log",
            EventKind::Other(s) => s,
        }
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "FuncCall" => EventKind::FuncCall,
            "FuncReturn" => EventKind::FuncReturn,
            "Message" => EventKind::Message,
            "Log" => EventKind::Log,
            _ => EventKind::Other(s),
        }
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        EventKind::from(s.to_string())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame of a runtime stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub line_number: u32,
    pub class_name: String,
    pub method_name: String,
    pub file_name: String,
}

/// A named parameter captured by a managed-runtime shim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedParam {
    pub name: String,
    pub value: String,
}

/// Payload attached only when the instrumentation inside a managed runtime
/// supplies it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub thread_name: String,
    pub stack: Vec<StackFrame>,
    pub params: Vec<NamedParam>,
}

/// A nondeterministic occurrence reported by one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id (UUID v4). Not part of history matching.
    pub id: String,
    /// Wall-clock arrival time. Not part of history matching.
    pub arrived_at: SystemTime,
    /// Entity that owns this event.
    pub entity_id: String,
    pub kind: EventKind,
    pub params: Params,
    /// Whether the entity waits for a scheduling decision.
    pub deferred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeInfo>,
}

impl Event {
    /// A deferred event with an empty parameter bag.
    pub fn new(entity_id: impl Into<String>, kind: impl Into<EventKind>) -> Self {
        Self {
            id: new_signal_id(),
            arrived_at: SystemTime::now(),
            entity_id: entity_id.into(),
            kind: kind.into(),
            params: Params::new(),
            deferred: true,
            runtime: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_deferred(mut self, deferred: bool) -> Self {
        self.deferred = deferred;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeInfo) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// Equality used for history matching: same entity, same kind, same
    /// parameters. Ids, timestamps and runtime payload are ignored.
    pub fn matches(&self, other: &Event) -> bool {
        self.entity_id == other.entity_id && self.kind == other.kind && self.params == other.params
    }

    /// Build the action that releases this event unchanged.
    pub fn accept_action(&self) -> Result<Action, SignalError> {
        if !self.deferred {
            return Err(SignalError::NotDeferred {
                event_id: self.id.clone(),
            });
        }
        let mut params = Params::new();
        params.insert("event_uuid".to_string(), self.id.clone().into());
        let action = Action {
            id: new_signal_id(),
            kind: ActionKind::Accept,
            entity_id: self.entity_id.clone(),
            params,
            orchestrator_local: false,
            event: Some(self.clone()),
            triggered_at: None,
        };
        action.validate()?;
        Ok(action)
    }

    /// Build an action that resolves this event by injecting `fault` into
    /// the owning entity.
    pub fn fault_action(&self, fault: FaultKind) -> Result<Action, SignalError> {
        let mut params = Params::new();
        params.insert("event_uuid".to_string(), self.id.clone().into());
        params.insert("fault".to_string(), fault.as_str().into());
        let action = Action {
            id: new_signal_id(),
            kind: ActionKind::FaultInjection,
            entity_id: self.entity_id.clone(),
            params,
            orchestrator_local: false,
            event: Some(self.clone()),
            triggered_at: None,
        };
        action.validate()?;
        Ok(action)
    }

    /// Accept for deferred events. Passive events get an orchestrator-local
    /// no-op, which is recorded but never sent back to the entity.
    pub fn default_action(&self) -> Result<Action, SignalError> {
        if self.deferred {
            return self.accept_action();
        }
        Ok(Action {
            id: new_signal_id(),
            kind: ActionKind::Nop,
            entity_id: self.entity_id.clone(),
            params: Params::new(),
            orchestrator_local: true,
            event: Some(self.clone()),
            triggered_at: None,
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event{{entity={}, type={}, deferred={}, params={}}}",
            self.entity_id,
            self.kind,
            self.deferred,
            serde_json::Value::Object(self.params.clone().into_iter().collect())
        )
    }
}

/// Element-wise [`Event::matches`] over two sequences of equal length.
pub fn events_match(a: &[Event], b: &[Event]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.matches(y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_ignores_id_and_time() {
        let a = Event::new("e1", EventKind::FuncCall).with_param("name", "write");
        let mut b = Event::new("e1", EventKind::FuncCall).with_param("name", "write");
        b.arrived_at = SystemTime::UNIX_EPOCH;
        assert_ne!(a.id, b.id);
        assert!(a.matches(&b));
    }

    #[test]
    fn test_matches_compares_entity_kind_params() {
        let base = Event::new("e1", EventKind::FuncCall).with_param("name", "write");
        assert!(!base.matches(&Event::new("e2", EventKind::FuncCall).with_param("name", "write")));
        assert!(!base.matches(&Event::new("e1", EventKind::FuncReturn).with_param("name", "write")));
        assert!(!base.matches(&Event::new("e1", EventKind::FuncCall).with_param("name", "read")));
    }

    #[test]
    fn test_kind_roundtrips_unknown_tags() {
        assert_eq!(EventKind::from("FuncCall"), EventKind::FuncCall);
        assert_eq!(
            EventKind::from("PacketEvent"),
            EventKind::Other("PacketEvent".to_string())
        );
        let json = serde_json::to_string(&EventKind::Other("PacketEvent".into())).unwrap();
        assert_eq!(json, "\"PacketEvent\"");
    }

    #[test]
    fn test_accept_rejects_passive_event() {
        let ev = Event::new("e1", EventKind::Log).with_deferred(false);
        assert!(matches!(
            ev.accept_action(),
            Err(SignalError::NotDeferred { .. })
        ));
    }

    #[test]
    fn test_default_action_for_passive_event_is_local() {
        let ev = Event::new("e1", EventKind::Log).with_deferred(false);
        let action = ev.default_action().unwrap();
        assert_eq!(action.kind, ActionKind::Nop);
        assert!(action.orchestrator_local);
        assert_eq!(action.entity_id, "e1");
    }

    #[test]
    fn test_events_match_requires_equal_length() {
        let a = vec![Event::new("e1", EventKind::Message)];
        assert!(!events_match(&a, &[]));
        assert!(events_match(&a, &[Event::new("e1", EventKind::Message)]));
    }
}
