//! Typed domain events decoded from the agent session stream.
//!
//! Submodules:
//! - `action`: things an actor asked to happen
//! - `observation`: results of things that happened
//! - `wire`: fail-soft JSON envelope codec and heartbeat frames

pub mod action;
pub mod observation;
pub mod wire;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use action::{Action, AgentState};
pub use observation::{Observation, ObservationKind};

/// Server-assigned event id. Ids increase within a conversation.
pub type EventId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Agent,
    User,
    /// Also the fallback for sources this client does not know.
    #[serde(other)]
    Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Action,
    Observation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Action(Action),
    Observation(Observation),
}

/// A decoded unit of protocol traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub id: Option<EventId>,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub message: Option<String>,
    /// Earlier event this one responds to. Passed through unvalidated.
    pub cause: Option<EventId>,
    pub kind: EventKind,
}

impl DomainEvent {
    /// A user-issued action, as handed to the outgoing queue.
    pub fn user_action(action: Action) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            source: EventSource::User,
            message: None,
            cause: None,
            kind: EventKind::Action(action),
        }
    }

    /// An observation produced by this client rather than the backend.
    pub fn local_observation(content: impl Into<String>, kind: ObservationKind) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            source: EventSource::Environment,
            message: None,
            cause: None,
            kind: EventKind::Observation(Observation {
                content: content.into(),
                kind,
            }),
        }
    }

    pub fn category(&self) -> EventCategory {
        match self.kind {
            EventKind::Action(_) => EventCategory::Action,
            EventKind::Observation(_) => EventCategory::Observation,
        }
    }

    pub fn type_tag(&self) -> &str {
        match &self.kind {
            EventKind::Action(action) => action.type_tag(),
            EventKind::Observation(obs) => obs.kind.type_tag(),
        }
    }

    pub fn as_action(&self) -> Option<&Action> {
        match &self.kind {
            EventKind::Action(action) => Some(action),
            EventKind::Observation(_) => None,
        }
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match &self.kind {
            EventKind::Observation(obs) => Some(obs),
            EventKind::Action(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            &self.kind,
            EventKind::Observation(Observation {
                kind: ObservationKind::Error(_),
                ..
            })
        )
    }

    /// What a batch or throttle groups by: a file path, a stream subject.
    pub fn subject(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Action(Action::Read(args)) => Some(&args.path),
            EventKind::Action(Action::Write(args)) => Some(&args.path),
            EventKind::Action(Action::Edit(args)) => Some(&args.path),
            EventKind::Action(Action::Unknown { args, .. }) => raw_subject(args),
            EventKind::Action(_) => None,
            EventKind::Observation(obs) => match &obs.kind {
                ObservationKind::Read(extras) | ObservationKind::Write(extras) => {
                    Some(&extras.path)
                }
                ObservationKind::Edit(extras) => Some(&extras.path),
                ObservationKind::FileChanged(extras) => Some(&extras.path),
                ObservationKind::Progress(extras) => Some(&extras.subject),
                ObservationKind::Unknown { extras, .. } => raw_subject(extras),
                _ => None,
            },
        }
    }

    /// Final/complete events are never superseded by throttling.
    pub fn is_final(&self) -> bool {
        match &self.kind {
            EventKind::Action(Action::Finish(_)) => true,
            EventKind::Action(Action::Unknown { args, .. }) => raw_final(args),
            EventKind::Action(_) => false,
            EventKind::Observation(obs) => match &obs.kind {
                ObservationKind::Progress(extras) => extras.complete,
                ObservationKind::Unknown { extras, .. } => raw_final(extras),
                _ => false,
            },
        }
    }
}

fn raw_subject(map: &serde_json::Map<String, Value>) -> Option<&str> {
    map.get("subject")
        .or_else(|| map.get("path"))
        .and_then(Value::as_str)
}

fn raw_final(map: &serde_json::Map<String, Value>) -> bool {
    ["final", "complete"]
        .iter()
        .any(|key| map.get(*key).and_then(Value::as_bool).unwrap_or(false))
}

/// Selects which events a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventFilter {
    #[default]
    All,
    Category(EventCategory),
    /// Matches the type tag in either category.
    Type(String),
}

impl EventFilter {
    pub fn matches(&self, event: &DomainEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Category(category) => event.category() == *category,
            EventFilter::Type(tag) => event.type_tag() == tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::observation::{FileChange, FileChangedExtras, ProgressExtras};

    fn progress(complete: bool) -> DomainEvent {
        DomainEvent::local_observation(
            "partial",
            ObservationKind::Progress(ProgressExtras {
                subject: "reply-1".into(),
                complete,
            }),
        )
    }

    #[test]
    fn filters() {
        let action = DomainEvent::user_action(Action::message("hi"));
        let obs = progress(false);

        assert!(EventFilter::All.matches(&action));
        assert!(EventFilter::Category(EventCategory::Action).matches(&action));
        assert!(!EventFilter::Category(EventCategory::Action).matches(&obs));
        assert!(EventFilter::Type("progress".into()).matches(&obs));
        assert!(!EventFilter::Type("message".into()).matches(&obs));
    }

    #[test]
    fn subject_and_final() {
        assert_eq!(progress(false).subject(), Some("reply-1"));
        assert!(!progress(false).is_final());
        assert!(progress(true).is_final());

        let changed = DomainEvent::local_observation(
            "",
            ObservationKind::FileChanged(FileChangedExtras {
                path: "a.txt".into(),
                change: FileChange::Created,
            }),
        );
        assert_eq!(changed.subject(), Some("a.txt"));
        assert!(!changed.is_final());
    }

    #[test]
    fn unknown_payload_subject_and_final_flag() {
        let mut args = serde_json::Map::new();
        args.insert("subject".into(), Value::from("s1"));
        args.insert("final".into(), Value::from(true));
        let event = DomainEvent::user_action(Action::Unknown {
            action_type: "stream".into(),
            args,
        });
        assert_eq!(event.subject(), Some("s1"));
        assert!(event.is_final());
    }

    #[test]
    fn unknown_source_falls_back_to_environment() {
        let source: EventSource = serde_json::from_str("\"scheduler\"").unwrap();
        assert_eq!(source, EventSource::Environment);
        let source: EventSource = serde_json::from_str("\"agent\"").unwrap();
        assert_eq!(source, EventSource::Agent);
    }
}
