use std::collections::VecDeque;
use std::sync::Mutex;

use opsdeck_protocol::{
    BackendApi, BackendError, CapabilityDescriptor, ControlActionKind, EnvDiff, LifecycleState,
    TargetStatus,
};
use serde_json::{json, Value};

enum InvokeScript {
    Ok(Value),
    Err(BackendError),
    Hang,
}

/// Scripted backend double. Each call pops the next scripted response for
/// its method; an empty queue falls back to a benign default. Every call is
/// appended to an ordered log so tests can assert counts and sequencing.
pub(crate) struct MockBackend {
    statuses: Mutex<VecDeque<Result<LifecycleState, BackendError>>>,
    capabilities: Mutex<VecDeque<Result<usize, BackendError>>>,
    env_results: Mutex<VecDeque<Result<(), BackendError>>>,
    invoke_scripts: Mutex<VecDeque<InvokeScript>>,
    control_results: Mutex<VecDeque<Result<(), BackendError>>>,
    calls: Mutex<Vec<String>>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self {
            statuses: Mutex::new(VecDeque::new()),
            capabilities: Mutex::new(VecDeque::new()),
            env_results: Mutex::new(VecDeque::new()),
            invoke_scripts: Mutex::new(VecDeque::new()),
            control_results: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn script_status(&self, state: LifecycleState) {
        self.statuses.lock().unwrap().push_back(Ok(state));
    }

    pub(crate) fn script_status_err(&self, err: BackendError) {
        self.statuses.lock().unwrap().push_back(Err(err));
    }

    pub(crate) fn script_capabilities(&self, count: usize) {
        self.capabilities.lock().unwrap().push_back(Ok(count));
    }

    pub(crate) fn script_update_env_err(&self, err: BackendError) {
        self.env_results.lock().unwrap().push_back(Err(err));
    }

    pub(crate) fn script_invoke_ok(&self, payload: Value) {
        self.invoke_scripts
            .lock()
            .unwrap()
            .push_back(InvokeScript::Ok(payload));
    }

    pub(crate) fn script_invoke_err(&self, err: BackendError) {
        self.invoke_scripts
            .lock()
            .unwrap()
            .push_back(InvokeScript::Err(err));
    }

    pub(crate) fn script_invoke_hang(&self) {
        self.invoke_scripts
            .lock()
            .unwrap()
            .push_back(InvokeScript::Hang);
    }

    pub(crate) fn script_control_err(&self, err: BackendError) {
        self.control_results.lock().unwrap().push_back(Err(err));
    }

    pub(crate) fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn capability(index: usize) -> CapabilityDescriptor {
    CapabilityDescriptor {
        name: format!("tool-{index}"),
        description: format!("scripted capability {index}"),
        input_schema: json!({"type": "object"}),
    }
}

#[async_trait::async_trait]
impl BackendApi for MockBackend {
    async fn fetch_status(&self, target: &str) -> Result<TargetStatus, BackendError> {
        self.log(format!("fetch_status:{target}"));
        let next = self.statuses.lock().unwrap().pop_front();
        match next {
            Some(Ok(state)) => Ok(TargetStatus::new(target, state)),
            Some(Err(err)) => Err(err),
            None => Ok(TargetStatus::new(target, LifecycleState::Running)),
        }
    }

    async fn update_env(&self, target: &str, diff: &EnvDiff) -> Result<(), BackendError> {
        self.log(format!("update_env:{target}:{}", diff.len()));
        self.env_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn list_capabilities(
        &self,
        target: &str,
    ) -> Result<Vec<CapabilityDescriptor>, BackendError> {
        self.log(format!("list_capabilities:{target}"));
        let next = self.capabilities.lock().unwrap().pop_front();
        match next {
            Some(Ok(count)) => Ok((0..count).map(capability).collect()),
            Some(Err(err)) => Err(err),
            None => Ok(Vec::new()),
        }
    }

    async fn invoke_capability(
        &self,
        target: &str,
        capability: &str,
        _args: &Value,
    ) -> Result<Value, BackendError> {
        self.log(format!("invoke_capability:{target}:{capability}"));
        let next = self.invoke_scripts.lock().unwrap().pop_front();
        match next {
            Some(InvokeScript::Ok(payload)) => Ok(payload),
            Some(InvokeScript::Err(err)) => Err(err),
            Some(InvokeScript::Hang) => {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
            None => Ok(json!({"ok": true})),
        }
    }

    async fn control_action(
        &self,
        target: &str,
        kind: ControlActionKind,
    ) -> Result<(), BackendError> {
        self.log(format!("control_action:{target}:{kind}"));
        self.control_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}
