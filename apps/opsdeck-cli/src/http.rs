use std::time::Duration;

use opsdeck_protocol::{
    BackendApi, BackendError, CapabilityDescriptor, ControlActionKind, EnvDiff, LifecycleState,
    TargetStatus,
};
use serde::Deserialize;
use serde_json::{json, Value};

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn connect_timeout() -> Duration {
    Duration::from_secs(env_u64("OPSDECK_HTTP_CONNECT_TIMEOUT_SECS", 3).max(1))
}

fn request_timeout() -> Duration {
    Duration::from_secs(env_u64("OPSDECK_HTTP_TIMEOUT_SECS", 30).max(1))
}

fn user_agent() -> String {
    format!("opsdeck-cli/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusWire {
    state: String,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    uptime_seconds: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeWire {
    result_payload: Value,
}

/// REST-shaped implementation of the backend contract.
pub struct HttpBackend {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base: &str, token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent())
            .connect_timeout(connect_timeout())
            .timeout(request_timeout())
            .build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => req.bearer_auth(token),
            _ => req,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, BackendError> {
        let resp = self
            .with_auth(self.client.get(self.url(path)))
            .send()
            .await
            .map_err(transport)?;
        decode(check(resp).await?).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, BackendError> {
        let resp = self
            .with_auth(self.client.post(self.url(path)).json(body))
            .send()
            .await
            .map_err(transport)?;
        decode(check(resp).await?).await
    }

    async fn post_ack(&self, path: &str, body: &Value) -> Result<(), BackendError> {
        let resp = self
            .with_auth(self.client.post(self.url(path)).json(body))
            .send()
            .await
            .map_err(transport)?;
        check(resp).await.map(|_| ())
    }
}

fn transport(err: reqwest::Error) -> BackendError {
    BackendError::Unavailable(err.to_string())
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let trimmed = body.trim();
    if trimmed.is_empty() {
        Err(BackendError::Rejected(status.to_string()))
    } else {
        Err(BackendError::Rejected(trimmed.to_string()))
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, BackendError> {
    resp.json::<T>()
        .await
        .map_err(|err| BackendError::Protocol(err.to_string()))
}

#[async_trait::async_trait]
impl BackendApi for HttpBackend {
    async fn fetch_status(&self, target: &str) -> Result<TargetStatus, BackendError> {
        let wire: StatusWire = self
            .get_json(&format!("/targets/{target}/status"))
            .await?;
        let state = LifecycleState::from_slug(&wire.state).ok_or_else(|| {
            BackendError::Protocol(format!("unknown lifecycle state `{}`", wire.state))
        })?;
        let mut status = TargetStatus::new(target, state);
        status.pid = wire.pid;
        status.uptime_seconds = wire.uptime_seconds;
        Ok(status)
    }

    async fn update_env(&self, target: &str, diff: &EnvDiff) -> Result<(), BackendError> {
        let body = serde_json::to_value(diff)
            .map_err(|err| BackendError::Protocol(err.to_string()))?;
        self.post_ack(&format!("/targets/{target}/env"), &body).await
    }

    async fn list_capabilities(
        &self,
        target: &str,
    ) -> Result<Vec<CapabilityDescriptor>, BackendError> {
        self.get_json(&format!("/targets/{target}/tools")).await
    }

    async fn invoke_capability(
        &self,
        target: &str,
        capability: &str,
        args: &Value,
    ) -> Result<Value, BackendError> {
        let wire: InvokeWire = self
            .post_json(
                &format!("/targets/{target}/tools/{capability}/invoke"),
                &json!({"args": args}),
            )
            .await?;
        Ok(wire.result_payload)
    }

    async fn control_action(
        &self,
        target: &str,
        kind: ControlActionKind,
    ) -> Result<(), BackendError> {
        self.post_ack(
            &format!("/targets/{target}/actions/{}", kind.as_str()),
            &json!({}),
        )
        .await
    }
}
