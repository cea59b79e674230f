//! Client-side orchestration for an operator console over managed backend
//! targets (MCP servers and model instances): per-target action locking,
//! bounded lifecycle polling, the env-apply workflow, last-request-wins tool
//! invocation, and a bounded persisted execution history.

use std::path::PathBuf;
use std::sync::Arc;

use opsdeck_events::{topics, Bus, Envelope};
use opsdeck_protocol::{
    ActionKind, BackendApi, BackendError, ControlActionKind, EnvDiff, InvocationRecord,
    TargetStatus,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub mod config;
pub mod guard;
pub mod history;
pub mod invoke;
pub mod poller;
pub mod reconfigure;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::ControlOptions;
pub use guard::{ActionGuard, ActionPermit};
pub use history::{ExecutionHistoryStore, HistoryError, HistoryOptions};
pub use invoke::{InvocationReport, ToolInvocationEngine};
pub use poller::{wait_for, PollOutcome, PollPolicy};
pub use reconfigure::{EnvReconfigurationCoordinator, ReconfigureOutcome, ReconfigureStage};
pub use registry::TargetRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Guard rejection: synchronous, fails fast, no side effects, never
    /// retried. `kind` is the action currently holding the target.
    #[error("action `{kind}` already in progress for target `{target}`")]
    AlreadyInProgress { target: String, kind: ActionKind },
    /// Malformed arguments detected before any network call.
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Terminal outcome of a start/stop/restart request.
#[derive(Debug)]
pub enum ControlOutcome {
    /// The backend accepted the action and the expected state was observed.
    Confirmed { status: TargetStatus },
    /// The backend accepted the action but the expected state was not
    /// observed within the poll budget; warning-grade, not a failure.
    Unconfirmed,
    /// The backend refused the action; message propagated verbatim.
    Failed { message: String },
    /// Cancelled by the operator; not an error.
    Cancelled,
}

impl ControlOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlOutcome::Confirmed { .. } => "confirmed",
            ControlOutcome::Unconfirmed => "unconfirmed",
            ControlOutcome::Failed { .. } => "failed",
            ControlOutcome::Cancelled => "cancelled",
        }
    }
}

/// Facade over the orchestration core. Every user-initiated operation
/// reaches exactly one terminal, user-visible outcome; progress transitions
/// are published on the bus for the presentation layer.
pub struct ControlPlane {
    backend: Arc<dyn BackendApi>,
    bus: Bus,
    guard: Arc<ActionGuard>,
    registry: TargetRegistry,
    history: Arc<ExecutionHistoryStore>,
    engine: ToolInvocationEngine,
    coordinator: EnvReconfigurationCoordinator,
    options: ControlOptions,
}

impl ControlPlane {
    /// Open the control plane against `backend`, with history persisted
    /// under `state_dir`.
    pub async fn open(
        backend: Arc<dyn BackendApi>,
        state_dir: impl Into<PathBuf>,
        options: ControlOptions,
    ) -> Result<Self, ControlError> {
        let bus = Bus::new(256);
        let guard = ActionGuard::new();
        let registry = TargetRegistry::new(bus.clone());
        let history = Arc::new(
            ExecutionHistoryStore::open(HistoryOptions::new(state_dir, options.history_limit))
                .await
                .map_err(|err| ControlError::Storage(err.to_string()))?,
        );
        let engine = ToolInvocationEngine::new(
            Arc::clone(&backend),
            Arc::clone(&history),
            bus.clone(),
            Arc::clone(&guard),
            options.result_snapshot_max_bytes,
        );
        let coordinator = EnvReconfigurationCoordinator::new(
            Arc::clone(&backend),
            registry.clone(),
            Arc::clone(&guard),
            bus.clone(),
            options.restart_poll,
            options.discovery_poll,
        );
        Ok(Self {
            backend,
            bus,
            guard,
            registry,
            history,
            engine,
            coordinator,
            options,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.bus.subscribe()
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub async fn start(
        &self,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<ControlOutcome, ControlError> {
        self.control(target, ControlActionKind::Start, cancel).await
    }

    pub async fn stop(
        &self,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<ControlOutcome, ControlError> {
        self.control(target, ControlActionKind::Stop, cancel).await
    }

    pub async fn restart(
        &self,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<ControlOutcome, ControlError> {
        self.control(target, ControlActionKind::Restart, cancel)
            .await
    }

    async fn control(
        &self,
        target: &str,
        kind: ControlActionKind,
        cancel: &CancellationToken,
    ) -> Result<ControlOutcome, ControlError> {
        let _permit = self.guard.acquire(target, kind.lock_kind())?;
        self.bus.publish(
            topics::TOPIC_ACTION_REQUESTED,
            &json!({"target": target, "kind": kind.as_str()}),
        );

        if let Err(err) = self.backend.control_action(target, kind).await {
            let message = err.to_string();
            warn!(
                target: "opsdeck::control",
                id = %target,
                kind = %kind,
                error = %message,
                "control action refused by backend"
            );
            return Ok(self.finish_action(target, kind, ControlOutcome::Failed { message }));
        }

        let backend = Arc::clone(&self.backend);
        let registry = self.registry.clone();
        let id = target.to_string();
        let settled = kind.settled_state();
        let poll = wait_for(
            move || {
                let backend = Arc::clone(&backend);
                let registry = registry.clone();
                let id = id.clone();
                async move {
                    let status = backend.fetch_status(&id).await?;
                    registry.apply_status(status.clone()).await;
                    Ok::<_, BackendError>(status)
                }
            },
            |status| status.state == settled,
            self.options.control_poll,
            cancel,
        )
        .await;

        let outcome = match poll {
            PollOutcome::Reached(status) => ControlOutcome::Confirmed { status },
            PollOutcome::TimedOut => ControlOutcome::Unconfirmed,
            PollOutcome::Cancelled => ControlOutcome::Cancelled,
        };
        Ok(self.finish_action(target, kind, outcome))
    }

    fn finish_action(
        &self,
        target: &str,
        kind: ControlActionKind,
        outcome: ControlOutcome,
    ) -> ControlOutcome {
        self.bus.publish(
            topics::TOPIC_ACTION_COMPLETED,
            &json!({
                "target": target,
                "kind": kind.as_str(),
                "outcome": outcome.as_str(),
            }),
        );
        outcome
    }

    /// Apply an environment diff and follow the restart/discovery workflow
    /// through to its terminal outcome.
    pub async fn submit_env_diff(
        &self,
        target: &str,
        diff: &EnvDiff,
        cancel: &CancellationToken,
    ) -> Result<ReconfigureOutcome, ControlError> {
        self.coordinator.submit(target, diff, cancel).await
    }

    /// Run a capability with last-request-wins supersede semantics.
    pub async fn run_capability(
        &self,
        target: &str,
        capability: &str,
        args: Value,
    ) -> Result<InvocationReport, ControlError> {
        self.engine.execute(target, capability, args).await
    }

    /// Cancel the outstanding invocation for `target`, if any.
    pub fn cancel_invocation(&self, target: &str) {
        self.engine.cancel(target);
    }

    /// One-shot status fetch, also updating the registry.
    pub async fn refresh_status(&self, target: &str) -> Result<TargetStatus, ControlError> {
        let status = self.backend.fetch_status(target).await?;
        self.registry.apply_status(status.clone()).await;
        Ok(status)
    }

    pub async fn list_capabilities(
        &self,
        target: &str,
    ) -> Result<Vec<opsdeck_protocol::CapabilityDescriptor>, ControlError> {
        Ok(self.backend.list_capabilities(target).await?)
    }

    pub async fn history(&self, target: &str, capability: &str) -> Vec<InvocationRecord> {
        self.history.entries(target, capability).await
    }

    /// Argument snapshot for a past invocation, for repopulating an input
    /// form. `None` when the id is unknown.
    pub async fn replay(&self, id: &str) -> Option<Value> {
        self.history.load_for_replay(id).await
    }

    pub async fn clear_history(&self, target: &str, capability: &str) -> Result<(), ControlError> {
        self.history
            .clear(target, capability)
            .await
            .map_err(|err| ControlError::Storage(err.to_string()))?;
        self.bus.publish(
            topics::TOPIC_HISTORY_CLEARED,
            &json!({"target": target, "capability": capability}),
        );
        Ok(())
    }
}
