//! Approval workflow models.
//!
//! The workflow engine is a separate service. These are the shapes exchanged
//! with it: the start request sent when a write needs approval, and the
//! completion callback it sends back.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Business type of deferred Redis write commands.
pub const REDIS_RUN_WRITE_CMD_FLOW_BIZ_TYPE: &str = "redis_run_write_cmd_flow";

/// Terminal or intermediate status of a workflow instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProcinstStatus {
    /// Waiting for approval.
    Pending,
    /// Approved through every node.
    Completed,
    /// Rejected by an approver.
    Rejected,
    /// Sent back to the submitter.
    Back,
    /// Cancelled by the submitter.
    Cancelled,
    /// Terminated by an administrator.
    Terminated,
}

impl ProcinstStatus {
    /// Human readable description for logs.
    pub fn desc(self) -> &'static str {
        match self {
            ProcinstStatus::Pending => "待处理",
            ProcinstStatus::Completed => "完成",
            ProcinstStatus::Rejected => "拒绝",
            ProcinstStatus::Back => "回退",
            ProcinstStatus::Cancelled => "取消",
            ProcinstStatus::Terminated => "终止",
        }
    }
}

/// Request to start a workflow instance for a business operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartProcParam {
    /// Business type the callback is routed by.
    pub biz_type: String,
    /// Unique business key of this submission.
    pub biz_key: String,
    /// Serialized business payload, stored opaquely by the engine.
    pub biz_form: String,
    /// Submitter remark.
    pub remark: String,
}

/// Workflow completion callback payload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BizHandleParam {
    /// Business key given at start.
    pub biz_key: String,
    /// Business type given at start.
    #[serde(default)]
    pub biz_type: String,
    /// Status the instance ended in.
    #[serde(alias = "status")]
    pub procinst_status: ProcinstStatus,
    /// Business payload given at start.
    pub biz_form: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_accepts_status_alias() {
        let json = r#"{"bizKey":"k1","status":"rejected","bizForm":"{}"}"#;
        let param: BizHandleParam = serde_json::from_str(json).unwrap();
        assert_eq!(param.procinst_status, ProcinstStatus::Rejected);
        assert_eq!(param.biz_key, "k1");
    }
}
