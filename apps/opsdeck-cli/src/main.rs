use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use opsdeck_control::{ControlOptions, ControlOutcome, ControlPlane, InvocationReport, ReconfigureOutcome};
use opsdeck_events::{topics, Envelope};
use opsdeck_protocol::{ControlActionKind, EnvDiff};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod http;

use http::HttpBackend;

#[derive(Debug, Parser)]
#[command(
    name = "opsdeck",
    version,
    about = "Operator console for managed backend targets"
)]
struct Args {
    #[arg(long, env = "BASE", default_value = "http://127.0.0.1:8091")]
    base: String,
    #[arg(long, env = "OPSDECK_TOKEN")]
    token: Option<String>,
    /// Directory holding persisted execution history.
    #[arg(long, env = "OPSDECK_STATE_DIR", default_value = ".opsdeck")]
    state_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch and print the current status of a target
    Status { target: String },
    /// Start a target and await confirmation
    Start { target: String },
    /// Stop a target and await confirmation
    Stop { target: String },
    /// Restart a target and await confirmation
    Restart { target: String },
    /// Apply an environment diff and follow the restart workflow
    ApplyEnv {
        target: String,
        /// Set a variable, e.g. --set API_KEY=x (repeatable)
        #[arg(long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,
        /// Delete a variable (repeatable)
        #[arg(long = "unset", value_name = "NAME")]
        unset: Vec<String>,
    },
    /// Invoke a capability with JSON arguments
    Run {
        target: String,
        capability: String,
        #[arg(long, default_value = "{}")]
        args: String,
        /// Re-run the arguments recorded under a past invocation id
        #[arg(long, conflicts_with = "args")]
        replay: Option<String>,
    },
    /// List the capabilities a target exposes
    Tools { target: String },
    /// Show recorded invocations for a capability
    History { target: String, capability: String },
    /// Print the argument snapshot of a past invocation
    Replay { id: String },
    /// Drop recorded invocations for a capability
    ClearHistory { target: String, capability: String },
    /// Poll targets and print state changes as they happen
    Watch {
        targets: Vec<String>,
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
    },
}

fn parse_env_args(set: &[String], unset: &[String]) -> Result<EnvDiff> {
    let mut diff = EnvDiff::new();
    for entry in set {
        let (name, value) = entry
            .split_once('=')
            .with_context(|| format!("--set expects NAME=VALUE, got `{entry}`"))?;
        diff = diff.set(name, value);
    }
    for name in unset {
        diff = diff.unset(name.as_str());
    }
    Ok(diff)
}

/// One-line summary for a progress event, or `None` for kinds the console
/// does not render.
fn event_summary(env: &Envelope) -> Option<String> {
    let payload = &env.payload;
    let target = payload["target"].as_str().or_else(|| payload["id"].as_str());
    match env.kind.as_str() {
        topics::TOPIC_TARGET_STATE_CHANGED => Some(format!(
            "{} -> {}",
            target.unwrap_or("?"),
            payload["state"].as_str().unwrap_or("?")
        )),
        topics::TOPIC_ACTION_REQUESTED => Some(format!(
            "{} {} requested",
            target.unwrap_or("?"),
            payload["kind"].as_str().unwrap_or("?")
        )),
        topics::TOPIC_ACTION_COMPLETED => Some(format!(
            "{} {} {}",
            target.unwrap_or("?"),
            payload["kind"].as_str().unwrap_or("?"),
            payload["outcome"].as_str().unwrap_or("?")
        )),
        topics::TOPIC_RECONFIGURE_STAGE => Some(format!(
            "{} reconfigure: {}",
            target.unwrap_or("?"),
            payload["stage"].as_str().unwrap_or("?")
        )),
        topics::TOPIC_RECONFIGURE_COMPLETED => Some(format!(
            "{} reconfigure finished: {}",
            target.unwrap_or("?"),
            payload["outcome"].as_str().unwrap_or("?")
        )),
        topics::TOPIC_TOOL_STARTED => Some(format!(
            "{} running {}",
            target.unwrap_or("?"),
            payload["capability"].as_str().unwrap_or("?")
        )),
        topics::TOPIC_TOOL_SUPERSEDED => Some(format!(
            "{} invocation superseded",
            target.unwrap_or("?")
        )),
        topics::TOPIC_TOOL_COMPLETED => Some(format!(
            "{} {} {} ({} ms)",
            target.unwrap_or("?"),
            payload["capability"].as_str().unwrap_or("?"),
            payload["outcome"].as_str().unwrap_or("?"),
            payload["duration_ms"].as_u64().unwrap_or(0)
        )),
        _ => None,
    }
}

fn spawn_event_printer(plane: &ControlPlane) -> tokio::task::JoinHandle<()> {
    let mut rx = plane.subscribe();
    tokio::spawn(async move {
        while let Ok(env) = rx.recv().await {
            if let Some(summary) = event_summary(&env) {
                let now = Local::now().format("%H:%M:%S");
                println!("[{now}] {summary}");
            }
        }
    })
}

async fn run(args: Args) -> Result<()> {
    let backend = Arc::new(HttpBackend::new(&args.base, args.token.clone())?);
    let plane = ControlPlane::open(backend, &args.state_dir, ControlOptions::default())
        .await
        .context("open control plane")?;

    match args.command {
        Command::Status { target } => {
            let status = plane.refresh_status(&target).await?;
            let pid = status
                .pid
                .map(|pid| format!(" pid={pid}"))
                .unwrap_or_default();
            let uptime = status
                .uptime_seconds
                .map(|s| format!(" uptime={s}s"))
                .unwrap_or_default();
            println!("{} {}{pid}{uptime}", status.id, status.state.as_str());
        }
        Command::Start { target } => {
            control(&plane, &target, ControlActionKind::Start).await?;
        }
        Command::Stop { target } => {
            control(&plane, &target, ControlActionKind::Stop).await?;
        }
        Command::Restart { target } => {
            control(&plane, &target, ControlActionKind::Restart).await?;
        }
        Command::ApplyEnv { target, set, unset } => {
            let diff = parse_env_args(&set, &unset)?;
            let printer = spawn_event_printer(&plane);
            let outcome = plane
                .submit_env_diff(&target, &diff, &CancellationToken::new())
                .await;
            printer.abort();
            match outcome? {
                ReconfigureOutcome::Applied { capabilities } => {
                    println!("applied; {} capabilities discovered", capabilities.len());
                    for capability in capabilities {
                        println!("  {}", capability.name);
                    }
                }
                ReconfigureOutcome::AppliedToolsPending => {
                    println!("applied; capability list still empty, check again shortly");
                }
                ReconfigureOutcome::RestartUnconfirmed => {
                    println!(
                        "diff acknowledged, but the restart was not observed in time; \
                         verify the target manually"
                    );
                }
                ReconfigureOutcome::Rejected { message } => bail!("rejected: {message}"),
                ReconfigureOutcome::Cancelled => println!("cancelled"),
            }
        }
        Command::Run {
            target,
            capability,
            args: raw_args,
            replay,
        } => {
            let invocation_args = match replay {
                Some(id) => plane
                    .replay(&id)
                    .await
                    .with_context(|| format!("no recorded invocation `{id}`"))?,
                None => serde_json::from_str(&raw_args).context("--args must be valid JSON")?,
            };
            let printer = spawn_event_printer(&plane);
            let report = plane.run_capability(&target, &capability, invocation_args).await;
            printer.abort();
            match report? {
                InvocationReport::Success { record } => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&record.result).unwrap_or_default()
                    );
                    println!("ok in {} ms (invocation {})", record.duration_ms, record.id);
                }
                InvocationReport::Failure { record } => {
                    bail!(
                        "capability failed after {} ms: {}",
                        record.duration_ms,
                        record.error.unwrap_or_default()
                    );
                }
                InvocationReport::Cancelled => println!("cancelled"),
            }
        }
        Command::Tools { target } => {
            let capabilities = plane.list_capabilities(&target).await?;
            if capabilities.is_empty() {
                println!("no capabilities discovered");
            }
            for capability in capabilities {
                if capability.description.is_empty() {
                    println!("{}", capability.name);
                } else {
                    println!("{}  {}", capability.name, capability.description);
                }
            }
        }
        Command::History { target, capability } => {
            let entries = plane.history(&target, &capability).await;
            if entries.is_empty() {
                println!("no recorded invocations");
            }
            for record in entries {
                let time = record.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S");
                let detail = record.error.as_deref().unwrap_or("");
                println!(
                    "[{time}] {} {} {} ms {detail}",
                    record.id,
                    record.outcome.as_str(),
                    record.duration_ms
                );
            }
        }
        Command::Replay { id } => match plane.replay(&id).await {
            Some(snapshot) => println!(
                "{}",
                serde_json::to_string_pretty(&snapshot).unwrap_or_default()
            ),
            None => bail!("no recorded invocation `{id}`"),
        },
        Command::ClearHistory { target, capability } => {
            plane.clear_history(&target, &capability).await?;
            println!("history cleared for {target}/{capability}");
        }
        Command::Watch {
            targets,
            interval_secs,
        } => {
            if targets.is_empty() {
                bail!("watch needs at least one target id");
            }
            let _printer = spawn_event_printer(&plane);
            loop {
                for target in &targets {
                    if let Err(err) = plane.refresh_status(target).await {
                        let now = Local::now().format("%H:%M:%S");
                        eprintln!("[{now}] {target} status fetch failed: {err}");
                    }
                }
                tokio::time::sleep(Duration::from_secs(interval_secs.max(1))).await;
            }
        }
    }
    Ok(())
}

async fn control(plane: &ControlPlane, target: &str, kind: ControlActionKind) -> Result<()> {
    let printer = spawn_event_printer(plane);
    let cancel = CancellationToken::new();
    let outcome = match kind {
        ControlActionKind::Start => plane.start(target, &cancel).await,
        ControlActionKind::Stop => plane.stop(target, &cancel).await,
        ControlActionKind::Restart => plane.restart(target, &cancel).await,
    };
    printer.abort();
    match outcome? {
        ControlOutcome::Confirmed { status } => {
            println!("{} is {}", status.id, status.state.as_str());
            Ok(())
        }
        ControlOutcome::Unconfirmed => {
            println!("action accepted, but the expected state was not observed in time");
            Ok(())
        }
        ControlOutcome::Failed { message } => bail!("{message}"),
        ControlOutcome::Cancelled => {
            println!("cancelled");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    run(Args::parse()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsdeck_protocol::EnvChange;
    use serde_json::json;

    #[test]
    fn parse_env_args_builds_a_diff() {
        let diff = parse_env_args(
            &["API_KEY=x".to_string(), "MODEL=llama".to_string()],
            &["OLD_FLAG".to_string()],
        )
        .expect("parse");
        assert_eq!(diff.len(), 3);
        let changes: Vec<(&str, &EnvChange)> = diff.iter().collect();
        assert!(changes.iter().any(|(name, change)| {
            *name == "API_KEY" && matches!(change, EnvChange::Set { value } if value == "x")
        }));
        assert!(changes
            .iter()
            .any(|(name, change)| *name == "OLD_FLAG" && matches!(change, EnvChange::Unset)));
    }

    #[test]
    fn parse_env_args_rejects_missing_equals() {
        let err = parse_env_args(&["NO_VALUE".to_string()], &[]).unwrap_err();
        assert!(err.to_string().contains("NAME=VALUE"));
    }

    #[test]
    fn parse_env_args_keeps_equals_in_value() {
        let diff = parse_env_args(&["URL=http://host?a=b".to_string()], &[]).expect("parse");
        let changes: Vec<(&str, &EnvChange)> = diff.iter().collect();
        assert!(matches!(
            changes[0].1,
            EnvChange::Set { value } if value == "http://host?a=b"
        ));
    }

    fn envelope(kind: &str, payload: serde_json::Value) -> Envelope {
        Envelope {
            time: "2026-01-01T00:00:00.000Z".to_string(),
            kind: kind.to_string(),
            payload,
        }
    }

    #[test]
    fn event_summaries_cover_progress_kinds() {
        let state = envelope(
            topics::TOPIC_TARGET_STATE_CHANGED,
            json!({"id": "srv1", "state": "running"}),
        );
        assert_eq!(event_summary(&state).as_deref(), Some("srv1 -> running"));

        let stage = envelope(
            topics::TOPIC_RECONFIGURE_STAGE,
            json!({"target": "srv1", "stage": "awaiting_restart"}),
        );
        assert_eq!(
            event_summary(&stage).as_deref(),
            Some("srv1 reconfigure: awaiting_restart")
        );

        let tool = envelope(
            topics::TOPIC_TOOL_COMPLETED,
            json!({"target": "srv1", "capability": "search", "outcome": "success", "duration_ms": 12}),
        );
        assert_eq!(
            event_summary(&tool).as_deref(),
            Some("srv1 search success (12 ms)")
        );

        let unknown = envelope("something.else", json!({}));
        assert_eq!(event_summary(&unknown), None);
    }
}
