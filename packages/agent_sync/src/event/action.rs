use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Lifecycle state the backend agent reports (and the user can request).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Loading,
    Init,
    Running,
    AwaitingUserInput,
    AwaitingUserConfirmation,
    UserConfirmed,
    UserRejected,
    Paused,
    Stopped,
    Finished,
    Rejected,
    RateLimited,
    Error,
    /// A state newer than this client knows about.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageArgs {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub wait_for_response: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunArgs {
    pub command: String,
    #[serde(default)]
    pub is_input: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thought: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadArgs {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditArgs {
    pub path: String,
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_str: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_str: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowseArgs {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThinkArgs {
    pub thought: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinishArgs {
    #[serde(default)]
    pub final_thought: String,
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeAgentStateArgs {
    pub agent_state: AgentState,
}

/// Something an actor (agent or user) asked to happen.
///
/// On the wire the variant is the value of the `action` key and the payload
/// lives under `args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "args", rename_all = "snake_case")]
pub enum Action {
    Message(MessageArgs),
    Run(RunArgs),
    Read(ReadArgs),
    Write(WriteArgs),
    Edit(EditArgs),
    Browse(BrowseArgs),
    Think(ThinkArgs),
    Finish(FinishArgs),
    ChangeAgentState(ChangeAgentStateArgs),
    /// Action type this client does not model; raw payload is kept as-is.
    #[serde(skip)]
    Unknown {
        action_type: String,
        args: Map<String, Value>,
    },
}

impl Action {
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "message",
        "run",
        "read",
        "write",
        "edit",
        "browse",
        "think",
        "finish",
        "change_agent_state",
    ];

    pub fn message(content: impl Into<String>) -> Self {
        Action::Message(MessageArgs {
            content: content.into(),
            image_urls: Vec::new(),
            wait_for_response: false,
        })
    }

    pub fn type_tag(&self) -> &str {
        match self {
            Action::Message(_) => "message",
            Action::Run(_) => "run",
            Action::Read(_) => "read",
            Action::Write(_) => "write",
            Action::Edit(_) => "edit",
            Action::Browse(_) => "browse",
            Action::Think(_) => "think",
            Action::Finish(_) => "finish",
            Action::ChangeAgentState(_) => "change_agent_state",
            Action::Unknown { action_type, .. } => action_type,
        }
    }

    /// Build from a wire tag and its `args` object.
    pub(crate) fn from_parts(tag: &str, args: Value) -> Result<Self, SyncError> {
        if !Self::KNOWN_TYPES.contains(&tag) {
            let args = match args {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    return Err(SyncError::Protocol(format!(
                        "args for action '{tag}' must be an object, got {other}"
                    )));
                }
            };
            return Ok(Action::Unknown {
                action_type: tag.to_string(),
                args,
            });
        }
        let args = if args.is_null() {
            Value::Object(Map::new())
        } else {
            args
        };
        let tagged = serde_json::json!({ "action": tag, "args": args });
        serde_json::from_value(tagged)
            .map_err(|e| SyncError::Protocol(format!("malformed '{tag}' action: {e}")))
    }

    /// Split into the wire tag and `args` object.
    pub(crate) fn to_parts(&self) -> Result<(String, Value), SyncError> {
        if let Action::Unknown { action_type, args } = self {
            return Ok((action_type.clone(), Value::Object(args.clone())));
        }
        let mut value = serde_json::to_value(self)?;
        let args = value
            .get_mut("args")
            .map(Value::take)
            .unwrap_or_else(|| Value::Object(Map::new()));
        Ok((self.type_tag().to_string(), args))
    }
}
