use std::sync::Arc;

use opsdeck_events::{topics, Bus};
use opsdeck_protocol::{
    ActionKind, BackendApi, CapabilityDescriptor, EnvDiff, LifecycleState,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::guard::ActionGuard;
use crate::poller::{wait_for, PollOutcome, PollPolicy};
use crate::registry::TargetRegistry;
use crate::ControlError;

/// Workflow stage, published on the bus as each one is entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconfigureStage {
    Idle,
    Submitting,
    AwaitingRestart,
    VerifyingTools,
    Done,
}

impl ReconfigureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconfigureStage::Idle => "idle",
            ReconfigureStage::Submitting => "submitting",
            ReconfigureStage::AwaitingRestart => "awaiting_restart",
            ReconfigureStage::VerifyingTools => "verifying_tools",
            ReconfigureStage::Done => "done",
        }
    }
}

/// Terminal outcome of one `submit` run. Exactly one of these is produced
/// per run; there is no abandonment between stages.
#[derive(Debug)]
pub enum ReconfigureOutcome {
    /// Restart observed and the capability list repopulated.
    Applied {
        capabilities: Vec<CapabilityDescriptor>,
    },
    /// Restart observed, but the capability list stayed empty within its
    /// poll budget; it may simply need more time to populate.
    AppliedToolsPending,
    /// The backend acknowledged the diff but the restart was not observed
    /// within the poll budget. The diff is presumed applied server-side
    /// (the backend applies acknowledged diffs under at-least-once
    /// semantics); confirmation simply never arrived, so this is surfaced
    /// as a warning rather than success.
    RestartUnconfirmed,
    /// The backend refused the diff; it was not applied.
    Rejected { message: String },
    /// Cancelled by the operator; not an error.
    Cancelled,
}

impl ReconfigureOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconfigureOutcome::Applied { .. } => "applied",
            ReconfigureOutcome::AppliedToolsPending => "applied_tools_pending",
            ReconfigureOutcome::RestartUnconfirmed => "restart_unconfirmed",
            ReconfigureOutcome::Rejected { .. } => "rejected",
            ReconfigureOutcome::Cancelled => "cancelled",
        }
    }
}

/// Drives the "apply env → await restart → verify capability discovery"
/// workflow: `Idle → Submitting → AwaitingRestart → VerifyingTools → Done`.
pub struct EnvReconfigurationCoordinator {
    backend: Arc<dyn BackendApi>,
    registry: TargetRegistry,
    guard: Arc<ActionGuard>,
    bus: Bus,
    restart_poll: PollPolicy,
    discovery_poll: PollPolicy,
}

impl EnvReconfigurationCoordinator {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        registry: TargetRegistry,
        guard: Arc<ActionGuard>,
        bus: Bus,
        restart_poll: PollPolicy,
        discovery_poll: PollPolicy,
    ) -> Self {
        Self {
            backend,
            registry,
            guard,
            bus,
            restart_poll,
            discovery_poll,
        }
    }

    /// Submit an environment diff for `target`. Each call is a fresh run
    /// with a fresh lock acquisition; a concurrent submit for the same
    /// target fails fast with `AlreadyInProgress`.
    pub async fn submit(
        &self,
        target: &str,
        diff: &EnvDiff,
        cancel: &CancellationToken,
    ) -> Result<ReconfigureOutcome, ControlError> {
        diff.validate()
            .map_err(|err| ControlError::Invalid(err.to_string()))?;
        let _permit = self.guard.acquire(target, ActionKind::Reconfiguring)?;

        self.publish_stage(target, ReconfigureStage::Submitting);
        if let Err(err) = self.backend.update_env(target, diff).await {
            let message = err.to_string();
            warn!(
                target: "opsdeck::reconfigure",
                id = %target,
                error = %message,
                "env diff rejected by backend"
            );
            return Ok(self.finish(target, ReconfigureOutcome::Rejected { message }));
        }
        debug!(
            target: "opsdeck::reconfigure",
            id = %target,
            vars = diff.len(),
            "env diff acknowledged; awaiting restart"
        );

        self.publish_stage(target, ReconfigureStage::AwaitingRestart);
        let backend = Arc::clone(&self.backend);
        let registry = self.registry.clone();
        let id = target.to_string();
        let restart = wait_for(
            move || {
                let backend = Arc::clone(&backend);
                let registry = registry.clone();
                let id = id.clone();
                async move {
                    let status = backend.fetch_status(&id).await?;
                    registry.apply_status(status.clone()).await;
                    Ok::<_, opsdeck_protocol::BackendError>(status)
                }
            },
            |status| status.state == LifecycleState::Running,
            self.restart_poll,
            cancel,
        )
        .await;
        match restart {
            PollOutcome::Reached(_) => {}
            PollOutcome::TimedOut => {
                return Ok(self.finish(target, ReconfigureOutcome::RestartUnconfirmed));
            }
            PollOutcome::Cancelled => {
                return Ok(self.finish(target, ReconfigureOutcome::Cancelled));
            }
        }

        self.publish_stage(target, ReconfigureStage::VerifyingTools);
        let backend = Arc::clone(&self.backend);
        let id = target.to_string();
        let discovery = wait_for(
            move || {
                let backend = Arc::clone(&backend);
                let id = id.clone();
                async move { backend.list_capabilities(&id).await }
            },
            |capabilities: &Vec<CapabilityDescriptor>| !capabilities.is_empty(),
            self.discovery_poll,
            cancel,
        )
        .await;
        let outcome = match discovery {
            PollOutcome::Reached(capabilities) => ReconfigureOutcome::Applied { capabilities },
            PollOutcome::TimedOut => ReconfigureOutcome::AppliedToolsPending,
            PollOutcome::Cancelled => ReconfigureOutcome::Cancelled,
        };
        Ok(self.finish(target, outcome))
    }

    fn publish_stage(&self, target: &str, stage: ReconfigureStage) {
        self.bus.publish(
            topics::TOPIC_RECONFIGURE_STAGE,
            &json!({"target": target, "stage": stage.as_str()}),
        );
    }

    fn finish(&self, target: &str, outcome: ReconfigureOutcome) -> ReconfigureOutcome {
        self.publish_stage(target, ReconfigureStage::Done);
        self.bus.publish(
            topics::TOPIC_RECONFIGURE_COMPLETED,
            &json!({"target": target, "outcome": outcome.as_str()}),
        );
        info!(
            target: "opsdeck::reconfigure",
            id = %target,
            outcome = outcome.as_str(),
            "env reconfiguration finished"
        );
        outcome
    }
}
