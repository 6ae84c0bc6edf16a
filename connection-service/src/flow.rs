//! 审批流程服务客户端

use async_trait::async_trait;
use common::errors::{AppError, AppResult};
use common::models::StartProcParam;
use serde::Serialize;

/// 审批流程实例接口
#[async_trait]
pub trait ProcinstApp: Send + Sync {
    /// 按流程定义 key 启动流程实例
    async fn start_proc(&self, procdef_key: &str, param: StartProcParam) -> AppResult<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartProcRequest<'a> {
    procdef_key: &'a str,
    #[serde(flatten)]
    param: StartProcParam,
}

/// 通过 HTTP 调用外部流程服务
pub struct HttpProcinstClient {
    flow_service_url: String,
    http_client: reqwest::Client,
}

impl HttpProcinstClient {
    /// 创建新的流程服务客户端
    pub fn new(flow_service_url: String, http_client: reqwest::Client) -> Self {
        Self {
            flow_service_url: flow_service_url.trim_end_matches('/').to_string(),
            http_client,
        }
    }
}

#[async_trait]
impl ProcinstApp for HttpProcinstClient {
    async fn start_proc(&self, procdef_key: &str, param: StartProcParam) -> AppResult<()> {
        let url = format!("{}/api/flow/procinsts/start", self.flow_service_url);
        let biz_key = param.biz_key.clone();

        let response = self
            .http_client
            .post(&url)
            .json(&StartProcRequest { procdef_key, param })
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("无法连接到流程服务: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::ExternalService(format!(
                "流程服务启动流程失败: {}",
                response.status()
            )));
        }

        tracing::info!(procdef_key = %procdef_key, biz_key = %biz_key, "审批流程已启动");
        Ok(())
    }
}
