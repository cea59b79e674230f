//! Canonical event topic constants.
//!
//! Centralizes the strings used when publishing progress events so the
//! control crate and the console renderer stay in sync. Keep each section
//! alphabetized and favor dot.case names.

// Target lifecycle / registry
pub const TOPIC_TARGET_STATE_CHANGED: &str = "target.state.changed";

// Control actions (start / stop / restart)
pub const TOPIC_ACTION_COMPLETED: &str = "target.action.completed";
pub const TOPIC_ACTION_REQUESTED: &str = "target.action.requested";

// Env reconfiguration workflow
pub const TOPIC_RECONFIGURE_COMPLETED: &str = "target.reconfigure.completed";
pub const TOPIC_RECONFIGURE_STAGE: &str = "target.reconfigure.stage";

// Tool invocations
pub const TOPIC_TOOL_COMPLETED: &str = "tool.invocation.completed";
pub const TOPIC_TOOL_STARTED: &str = "tool.invocation.started";
pub const TOPIC_TOOL_SUPERSEDED: &str = "tool.invocation.superseded";

// Execution history
pub const TOPIC_HISTORY_CLEARED: &str = "tool.history.cleared";
