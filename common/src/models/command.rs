//! Redis command models.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

/// A command invocation against one Redis db.
///
/// This is also the business form stored by the workflow engine while a
/// write waits for approval, so its wire shape must stay stable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct RunCmdParam {
    /// Redis resource id.
    pub id: u64,
    /// Db index.
    pub db: u32,
    /// Command name followed by its arguments.
    #[schema(value_type = Vec<Object>)]
    pub cmd: Vec<serde_json::Value>,
    /// Submitter remark.
    #[serde(default)]
    pub remark: String,
}

/// Request body of the run-command endpoint.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RunCmdRequest {
    /// Command name followed by its arguments.
    #[validate(length(min = 1, message = "Command is required"))]
    #[schema(value_type = Vec<Object>)]
    pub cmd: Vec<serde_json::Value>,
    /// Remark attached to an approval request.
    #[serde(default)]
    pub remark: Option<String>,
}

/// Read/write classification of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    /// Does not modify data.
    Read,
    /// Modifies data or server state.
    Write,
}

/// Result of one command invocation.
///
/// `Pending` and `Done { result: None }` are both successes: the former means
/// the command is waiting for approval and has not run, the latter that it ran
/// and produced nothing (e.g. the key does not exist).
#[derive(Debug, Clone, Serialize, PartialEq, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CmdOutcome {
    /// Deferred until the approval workflow completes.
    Pending {
        /// Business key of the started workflow.
        biz_key: String,
    },
    /// Executed.
    Done {
        /// Command reply, absent for a nil reply.
        #[schema(value_type = Option<Object>)]
        result: Option<serde_json::Value>,
    },
}
