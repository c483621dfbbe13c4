use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::action::AgentState;
use crate::error::SyncError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunExtras {
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathExtras {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditExtras {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowseExtras {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorExtras {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStateExtras {
    pub agent_state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChange {
    Created,
    Modified,
    Deleted,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChangedExtras {
    pub path: String,
    pub change: FileChange,
}

/// Incremental text for one subject (a streaming reply, a long command).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressExtras {
    pub subject: String,
    #[serde(default)]
    pub complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityExtras {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueWarningExtras {
    pub pending: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropped_sequence: Option<u64>,
}

/// Typed payload of an observation. Wire tag is the `observation` key,
/// payload lives under `extras`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "observation", content = "extras", rename_all = "snake_case")]
pub enum ObservationKind {
    Run(RunExtras),
    Read(PathExtras),
    Write(PathExtras),
    Edit(EditExtras),
    Browse(BrowseExtras),
    Error(ErrorExtras),
    AgentStateChanged(AgentStateExtras),
    FileChanged(FileChangedExtras),
    Progress(ProgressExtras),
    Activity(ActivityExtras),
    QueueWarning(QueueWarningExtras),
    #[serde(skip)]
    Unknown {
        observation_type: String,
        extras: Map<String, Value>,
    },
}

/// The result of something that happened, with its text content.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub content: String,
    pub kind: ObservationKind,
}

impl ObservationKind {
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "run",
        "read",
        "write",
        "edit",
        "browse",
        "error",
        "agent_state_changed",
        "file_changed",
        "progress",
        "activity",
        "queue_warning",
    ];

    pub fn type_tag(&self) -> &str {
        match self {
            ObservationKind::Run(_) => "run",
            ObservationKind::Read(_) => "read",
            ObservationKind::Write(_) => "write",
            ObservationKind::Edit(_) => "edit",
            ObservationKind::Browse(_) => "browse",
            ObservationKind::Error(_) => "error",
            ObservationKind::AgentStateChanged(_) => "agent_state_changed",
            ObservationKind::FileChanged(_) => "file_changed",
            ObservationKind::Progress(_) => "progress",
            ObservationKind::Activity(_) => "activity",
            ObservationKind::QueueWarning(_) => "queue_warning",
            ObservationKind::Unknown {
                observation_type, ..
            } => observation_type,
        }
    }

    pub(crate) fn from_parts(tag: &str, extras: Value) -> Result<Self, SyncError> {
        if !Self::KNOWN_TYPES.contains(&tag) {
            let extras = match extras {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    return Err(SyncError::Protocol(format!(
                        "extras for observation '{tag}' must be an object, got {other}"
                    )));
                }
            };
            return Ok(ObservationKind::Unknown {
                observation_type: tag.to_string(),
                extras,
            });
        }
        let extras = if extras.is_null() {
            Value::Object(Map::new())
        } else {
            extras
        };
        let tagged = serde_json::json!({ "observation": tag, "extras": extras });
        serde_json::from_value(tagged)
            .map_err(|e| SyncError::Protocol(format!("malformed '{tag}' observation: {e}")))
    }

    pub(crate) fn to_parts(&self) -> Result<(String, Value), SyncError> {
        if let ObservationKind::Unknown {
            observation_type,
            extras,
        } = self
        {
            return Ok((observation_type.clone(), Value::Object(extras.clone())));
        }
        let mut value = serde_json::to_value(self)?;
        let extras = value
            .get_mut("extras")
            .map(Value::take)
            .unwrap_or_else(|| Value::Object(Map::new()));
        Ok((self.type_tag().to_string(), extras))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_changed_from_parts() {
        let kind = ObservationKind::from_parts(
            "file_changed",
            json!({"path": "src/main.rs", "change": "modified"}),
        )
        .unwrap();
        assert_eq!(
            kind,
            ObservationKind::FileChanged(FileChangedExtras {
                path: "src/main.rs".into(),
                change: FileChange::Modified,
            })
        );
    }

    #[test]
    fn activity_accepts_missing_extras() {
        let kind = ObservationKind::from_parts("activity", Value::Null).unwrap();
        assert_eq!(kind, ObservationKind::Activity(ActivityExtras {}));
    }

    #[test]
    fn unknown_observation_keeps_extras() {
        let kind = ObservationKind::from_parts("recall", json!({"query": "x"})).unwrap();
        assert_eq!(kind.type_tag(), "recall");
    }

    #[test]
    fn unknown_extras_must_be_object() {
        assert!(ObservationKind::from_parts("recall", json!([1, 2])).is_err());
    }

    #[test]
    fn to_parts_roundtrips_progress() {
        let kind = ObservationKind::Progress(ProgressExtras {
            subject: "reply-7".into(),
            complete: true,
        });
        let (tag, extras) = kind.to_parts().unwrap();
        assert_eq!(tag, "progress");
        assert_eq!(ObservationKind::from_parts(&tag, extras).unwrap(), kind);
    }
}
