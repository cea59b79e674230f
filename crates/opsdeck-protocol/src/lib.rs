use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type TargetId = String;

/// Lifecycle phase of a controllable backend target as last reported by the
/// backend. The set is closed; a slug outside it is a protocol error, not a
/// new state.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Restarting => "restarting",
            LifecycleState::Failed => "failed",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "Stopped",
            LifecycleState::Starting => "Starting",
            LifecycleState::Running => "Running",
            LifecycleState::Stopping => "Stopping",
            LifecycleState::Restarting => "Restarting",
            LifecycleState::Failed => "Failed",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "stopped" => Some(LifecycleState::Stopped),
            "starting" => Some(LifecycleState::Starting),
            "running" => Some(LifecycleState::Running),
            "stopping" => Some(LifecycleState::Stopping),
            "restarting" => Some(LifecycleState::Restarting),
            "failed" => Some(LifecycleState::Failed),
            _ => None,
        }
    }
}

/// Status snapshot for one target, the shape returned by
/// [`BackendApi::fetch_status`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TargetStatus {
    pub id: TargetId,
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl TargetStatus {
    pub fn new(id: impl Into<String>, state: LifecycleState) -> Self {
        Self {
            id: id.into(),
            state,
            pid: None,
            uptime_seconds: None,
            updated_at: Utc::now(),
        }
    }

    pub fn touch(mut self) -> Self {
        self.updated_at = Utc::now();
        self
    }

    /// Equality ignoring the observation timestamp.
    pub fn same_payload(&self, other: &Self) -> bool {
        self.id == other.id
            && self.state == other.state
            && self.pid == other.pid
            && self.uptime_seconds == other.uptime_seconds
    }
}

/// Kind of action currently holding a target's lock.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Starting,
    Stopping,
    Restarting,
    Reconfiguring,
    Invoking,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Starting => "starting",
            ActionKind::Stopping => "stopping",
            ActionKind::Restarting => "restarting",
            ActionKind::Reconfiguring => "reconfiguring",
            ActionKind::Invoking => "invoking",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process control verbs accepted by [`BackendApi::control_action`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlActionKind {
    Start,
    Stop,
    Restart,
}

impl ControlActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlActionKind::Start => "start",
            ControlActionKind::Stop => "stop",
            ControlActionKind::Restart => "restart",
        }
    }

    /// Lock kind held while the action is in flight.
    pub fn lock_kind(&self) -> ActionKind {
        match self {
            ControlActionKind::Start => ActionKind::Starting,
            ControlActionKind::Stop => ActionKind::Stopping,
            ControlActionKind::Restart => ActionKind::Restarting,
        }
    }

    /// Lifecycle state that confirms the action took effect.
    pub fn settled_state(&self) -> LifecycleState {
        match self {
            ControlActionKind::Start | ControlActionKind::Restart => LifecycleState::Running,
            ControlActionKind::Stop => LifecycleState::Stopped,
        }
    }
}

impl std::fmt::Display for ControlActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pending change to an environment variable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EnvChange {
    Set { value: String },
    Unset,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvDiffError {
    #[error("environment diff is empty")]
    Empty,
    #[error("invalid environment variable name `{0}`")]
    InvalidName(String),
}

/// A batch of environment variable changes, applied atomically by the
/// backend. Keys are unique and iterate in a stable order.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct EnvDiff {
    changes: BTreeMap<String, EnvChange>,
}

impl EnvDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.changes.insert(
            name.into(),
            EnvChange::Set {
                value: value.into(),
            },
        );
        self
    }

    pub fn unset(mut self, name: impl Into<String>) -> Self {
        self.changes.insert(name.into(), EnvChange::Unset);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EnvChange)> {
        self.changes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Reject a diff before it reaches the network: it must name at least
    /// one variable, and names must be non-empty, free of `=` and NUL, and
    /// not start with a digit.
    pub fn validate(&self) -> Result<(), EnvDiffError> {
        if self.changes.is_empty() {
            return Err(EnvDiffError::Empty);
        }
        for name in self.changes.keys() {
            let valid = !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name.chars().all(|c| c != '=' && c != '\0' && !c.is_whitespace());
            if !valid {
                return Err(EnvDiffError::InvalidName(name.clone()));
            }
        }
        Ok(())
    }
}

/// A named, schema-described operation a target exposes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    Success,
    Failure,
    Cancelled,
}

impl InvocationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationOutcome::Success => "success",
            InvocationOutcome::Failure => "failure",
            InvocationOutcome::Cancelled => "cancelled",
        }
    }
}

/// A finalized capability invocation. Records are self-describing so the
/// persisted form can be read without out-of-band context.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InvocationRecord {
    pub id: String,
    pub target: TargetId,
    pub capability: String,
    pub args: Value,
    pub started_at: DateTime<Utc>,
    pub outcome: InvocationOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached or answered with a transport-level
    /// failure. Pollers absorb these within their attempt budget.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The backend processed the request and refused it. The message is
    /// surfaced to the operator verbatim.
    #[error("{0}")]
    Rejected(String),
    /// The backend answered with a body this client cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The collaborator contract this layer consumes. The concrete transport is
/// out of scope; `apps/opsdeck-cli` implements it over REST.
///
/// `invoke_capability` is cancellable by dropping the returned future; the
/// invocation engine races it against a cancellation token.
#[async_trait::async_trait]
pub trait BackendApi: Send + Sync {
    async fn fetch_status(&self, target: &str) -> Result<TargetStatus, BackendError>;

    async fn update_env(&self, target: &str, diff: &EnvDiff) -> Result<(), BackendError>;

    async fn list_capabilities(
        &self,
        target: &str,
    ) -> Result<Vec<CapabilityDescriptor>, BackendError>;

    async fn invoke_capability(
        &self,
        target: &str,
        capability: &str,
        args: &Value,
    ) -> Result<Value, BackendError>;

    async fn control_action(
        &self,
        target: &str,
        kind: ControlActionKind,
    ) -> Result<(), BackendError>;
}
