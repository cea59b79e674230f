use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use opsdeck_events::{topics, Bus};
use opsdeck_protocol::{ActionKind, BackendApi, InvocationOutcome, InvocationRecord};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::guard::{ActionGuard, ActionPermit};
use crate::history::ExecutionHistoryStore;
use crate::ControlError;

/// Terminal outcome of one `execute` call. Cancellation is not an error and
/// carries no record; it is suppressed from user-visible error channels.
#[derive(Debug)]
pub enum InvocationReport {
    Success { record: InvocationRecord },
    Failure { record: InvocationRecord },
    Cancelled,
}

struct ActiveInvocation {
    generation: u64,
    cancel: CancellationToken,
    permit: ActionPermit,
}

enum RunResult {
    Success(Value),
    Failure(String),
    Cancelled,
}

/// Runs capability invocations with a last-request-wins policy: a newer
/// `execute` for the same target supersedes the outstanding one instead of
/// queueing behind it. Every invocation carries a generation token;
/// continuations compare their captured token against the session table
/// before touching shared state and no-op when stale.
pub struct ToolInvocationEngine {
    backend: Arc<dyn BackendApi>,
    history: Arc<ExecutionHistoryStore>,
    bus: Bus,
    guard: Arc<ActionGuard>,
    sessions: Mutex<HashMap<String, ActiveInvocation>>,
    generation: AtomicU64,
    max_result_bytes: usize,
}

impl ToolInvocationEngine {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        history: Arc<ExecutionHistoryStore>,
        bus: Bus,
        guard: Arc<ActionGuard>,
        max_result_bytes: usize,
    ) -> Self {
        Self {
            backend,
            history,
            bus,
            guard,
            sessions: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            max_result_bytes,
        }
    }

    /// Invoke `capability` on `target`. If an invocation for the target is
    /// still outstanding it is superseded: its cancellation token fires
    /// immediately and its lock permit transfers to this call, so the
    /// target's lock never passes through a free state mid-supersede.
    pub async fn execute(
        &self,
        target: &str,
        capability: &str,
        args: Value,
    ) -> Result<InvocationReport, ControlError> {
        if !args.is_object() {
            return Err(ControlError::Invalid(
                "capability arguments must be a JSON object".to_string(),
            ));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        {
            let mut sessions = self.sessions.lock().expect("session table lock poisoned");
            let permit = match sessions.remove(target) {
                Some(previous) => {
                    previous.cancel.cancel();
                    debug!(
                        target: "opsdeck::invoke",
                        id = %target,
                        superseded = previous.generation,
                        by = generation,
                        "invocation superseded"
                    );
                    self.bus.publish(
                        topics::TOPIC_TOOL_SUPERSEDED,
                        &json!({
                            "target": target,
                            "superseded_generation": previous.generation,
                            "superseding_generation": generation,
                        }),
                    );
                    previous.permit
                }
                None => self.guard.acquire(target, ActionKind::Invoking)?,
            };
            sessions.insert(
                target.to_string(),
                ActiveInvocation {
                    generation,
                    cancel: cancel.clone(),
                    permit,
                },
            );
        }

        let invocation_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();
        self.bus.publish(
            topics::TOPIC_TOOL_STARTED,
            &json!({
                "target": target,
                "capability": capability,
                "invocation": invocation_id,
                "generation": generation,
            }),
        );

        let run = tokio::select! {
            _ = cancel.cancelled() => RunResult::Cancelled,
            result = self.backend.invoke_capability(target, capability, &args) => {
                match result {
                    Ok(payload) => RunResult::Success(payload),
                    Err(err) => RunResult::Failure(err.to_string()),
                }
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if matches!(run, RunResult::Cancelled) {
            // The canceller removed the session entry before firing the
            // token; clear ours if it somehow survived.
            let mut sessions = self.sessions.lock().expect("session table lock poisoned");
            if matches!(sessions.get(target), Some(active) if active.generation == generation) {
                sessions.remove(target);
            }
            return Ok(InvocationReport::Cancelled);
        }

        // Resumption point: only the generation still in the session table
        // may finalize. A stale continuation discards its result.
        let authoritative = {
            let mut sessions = self.sessions.lock().expect("session table lock poisoned");
            match sessions.get(target) {
                Some(active) if active.generation == generation => {
                    sessions.remove(target);
                    true
                }
                _ => false,
            }
        };
        if !authoritative {
            debug!(
                target: "opsdeck::invoke",
                id = %target,
                generation,
                "stale invocation resolved after supersede; result discarded"
            );
            return Ok(InvocationReport::Cancelled);
        }

        let (outcome, result, error) = match run {
            RunResult::Success(payload) => (
                InvocationOutcome::Success,
                Some(bounded_snapshot(&payload, self.max_result_bytes)),
                None,
            ),
            RunResult::Failure(message) => (InvocationOutcome::Failure, None, Some(message)),
            RunResult::Cancelled => return Ok(InvocationReport::Cancelled),
        };

        let record = InvocationRecord {
            id: invocation_id.clone(),
            target: target.to_string(),
            capability: capability.to_string(),
            args,
            started_at,
            outcome,
            result,
            error,
            duration_ms,
        };
        if let Err(err) = self.history.append(record.clone()).await {
            warn!(
                target: "opsdeck::invoke",
                id = %target,
                error = %err,
                "failed to persist invocation record"
            );
        }
        self.publish_completed(target, capability, &invocation_id, outcome.as_str(), duration_ms);

        Ok(match outcome {
            InvocationOutcome::Success => InvocationReport::Success { record },
            _ => InvocationReport::Failure { record },
        })
    }

    /// Cancel the outstanding invocation for `target`, if any. The running
    /// continuation observes the missing session entry and resolves
    /// `Cancelled` without recording.
    pub fn cancel(&self, target: &str) {
        let removed = {
            let mut sessions = self.sessions.lock().expect("session table lock poisoned");
            sessions.remove(target)
        };
        if let Some(active) = removed {
            active.cancel.cancel();
            debug!(
                target: "opsdeck::invoke",
                id = %target,
                generation = active.generation,
                "invocation cancelled"
            );
        }
    }

    fn publish_completed(
        &self,
        target: &str,
        capability: &str,
        invocation_id: &str,
        outcome: &str,
        duration_ms: u64,
    ) {
        self.bus.publish(
            topics::TOPIC_TOOL_COMPLETED,
            &json!({
                "target": target,
                "capability": capability,
                "invocation": invocation_id,
                "outcome": outcome,
                "duration_ms": duration_ms,
            }),
        );
    }
}

/// Result payloads above the byte bound are replaced by a marker instead of
/// being recorded whole.
fn bounded_snapshot(value: &Value, max_bytes: usize) -> Value {
    match serde_json::to_vec(value) {
        Ok(bytes) if bytes.len() <= max_bytes => value.clone(),
        Ok(bytes) => json!({
            "truncated": true,
            "payload_bytes": bytes.len(),
        }),
        Err(_) => json!({"truncated": true}),
    }
}
