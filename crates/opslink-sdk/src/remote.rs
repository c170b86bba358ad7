//! 远端 REST 客户端 - 同步与通知端点
//!
//! 本模块封装控制台消费的通用 REST 契约（JSON 体，Bearer Token 认证）：
//! - `POST /sync/outbound/batch` 出站批量同步
//! - `GET /sync/inbound?since=` 入站增量拉取
//! - `GET /notifications/sync?since=` 通知增量拉取
//! - `POST /notifications/send`、`POST /messages/send` 与通用动作分发
//!
//! 认证是外部协作者：SDK 只通过 [`TokenProvider`] 获取不透明的 Bearer Token。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{OpslinkError, Result};
use crate::queue::{MessagePriority, QueuedMessage};

/// Bearer Token 提供者（认证/会话管理由外部负责）
#[async_trait]
pub trait TokenProvider: Send + Sync + std::fmt::Debug {
    /// 获取当前的 Bearer Token（未登录时为 None）
    async fn bearer_token(&self) -> Option<String>;

    /// 当前是否已认证
    async fn is_authenticated(&self) -> bool;
}

/// 固定 Token 的提供者（演示与测试用）
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Option<String> {
        Some(self.token.clone())
    }

    async fn is_authenticated(&self) -> bool {
        true
    }
}

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// REST 端点基础 URL（如 https://api.example.com）
    pub base_url: String,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

// ============================================================
// 线上契约类型
// ============================================================

/// 出站批量同步的单个条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundItem {
    /// 客户端临时 ID（即队列消息 ID），服务端以此回执
    pub temp_id: String,
    pub kind: String,
    pub priority: MessagePriority,
    pub payload: serde_json::Value,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

impl OutboundItem {
    /// 从队列消息构造线上条目
    pub fn from_message(message: &QueuedMessage) -> Result<Self> {
        Ok(Self {
            temp_id: message.id.clone(),
            kind: message.kind.name().to_string(),
            priority: message.priority,
            payload: serde_json::to_value(&message.payload)?,
            created_at: message.created_at,
            category: message.category.clone(),
            owner_id: message.owner_id.clone(),
        })
    }
}

/// 记录的一个版本（冲突双方各持一份）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordVersion {
    pub id: String,
    /// 内容字段（合并规则：本地内容胜出）
    pub content: serde_json::Value,
    /// 元数据字段（合并规则：远端元数据胜出）
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// 附件列表（合并规则：两边拼接）
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub updated_at: i64,
}

/// 远端报告的冲突对
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConflict {
    pub item_id: String,
    pub client_version: RecordVersion,
    pub server_version: RecordVersion,
}

/// `POST /sync/outbound/batch` 的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundBatchResponse {
    #[serde(default)]
    pub synced: Vec<SyncedItem>,
    #[serde(default)]
    pub conflicts: Vec<RemoteConflict>,
}

/// 已同步条目的回执
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncedItem {
    pub temp_id: String,
}

/// 入站消息记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: String,
    #[serde(default)]
    pub message_type: Option<String>,
    pub content: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub created_at: i64,
}

/// `GET /sync/inbound` 的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundBatch {
    #[serde(default)]
    pub messages: Vec<RemoteMessage>,
    /// 服务端报告的水位（整体成功后写回本地）
    pub server_timestamp: i64,
}

/// 通知记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteNotification {
    pub id: String,
    pub notification_type: String,
    pub priority: MessagePriority,
    pub title: String,
    pub body: String,
    pub created_at: i64,
}

/// `GET /notifications/sync` 的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationBatch {
    #[serde(default)]
    pub notifications: Vec<RemoteNotification>,
}

// ============================================================
// 客户端实现
// ============================================================

/// 同步服务消费的远端接口（测试注入替身的接缝）
#[async_trait]
pub trait RemoteApi: Send + Sync + std::fmt::Debug {
    async fn push_outbound_batch(&self, items: &[OutboundItem]) -> Result<OutboundBatchResponse>;
    async fn fetch_inbound(&self, since_ms: i64) -> Result<InboundBatch>;
    async fn fetch_notifications(&self, since_ms: i64) -> Result<NotificationBatch>;
}

/// REST API 客户端
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token_provider: Arc<dyn TokenProvider>,
}

impl ApiClient {
    /// 创建新的 API 客户端
    pub fn new(config: &HttpConfig, token_provider: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| OpslinkError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token_provider,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 构造带认证头的请求
    async fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let mut builder = self.client.request(method, self.url(path));
        if let Some(token) = self.token_provider.bearer_token().await {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    /// 检查响应状态，非 2xx 归类为投递拒绝
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_else(|_| "无法读取错误信息".to_string());
        error!("❌ 请求失败，HTTP 状态码: {}, 错误: {}", status, error_text);

        if status == StatusCode::REQUEST_TIMEOUT {
            return Err(OpslinkError::Timeout(error_text));
        }
        Err(OpslinkError::from_http_status(status.as_u16(), error_text))
    }

    /// 出站批量同步
    pub async fn push_outbound_batch(
        &self,
        items: &[OutboundItem],
    ) -> Result<OutboundBatchResponse> {
        debug!("📤 出站批量同步: {} 条", items.len());

        let response = self
            .request(Method::POST, "/sync/outbound/batch")
            .await?
            .json(&serde_json::json!({ "items": items }))
            .send()
            .await?;

        let response = Self::check_status(response).await?;
        let batch: OutboundBatchResponse = response
            .json()
            .await
            .map_err(|e| OpslinkError::Serialization(format!("解析出站批量响应失败: {}", e)))?;

        debug!(
            "📤 出站批量完成: synced={}, conflicts={}",
            batch.synced.len(),
            batch.conflicts.len()
        );
        Ok(batch)
    }

    /// 入站增量拉取
    pub async fn fetch_inbound(&self, since_ms: i64) -> Result<InboundBatch> {
        let path = format!("/sync/inbound?since={}", since_ms);
        let response = self.request(Method::GET, &path).await?.send().await?;
        let response = Self::check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| OpslinkError::Serialization(format!("解析入站响应失败: {}", e)))
    }

    /// 通知增量拉取
    pub async fn fetch_notifications(&self, since_ms: i64) -> Result<NotificationBatch> {
        let path = format!("/notifications/sync?since={}", since_ms);
        let response = self.request(Method::GET, &path).await?.send().await?;
        let response = Self::check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| OpslinkError::Serialization(format!("解析通知响应失败: {}", e)))
    }

    /// 发送单条通知
    pub async fn send_notification(&self, payload: &serde_json::Value) -> Result<()> {
        let response = self
            .request(Method::POST, "/notifications/send")
            .await?
            .json(payload)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    /// 发送单条消息
    pub async fn send_message(&self, payload: &serde_json::Value) -> Result<()> {
        let response = self
            .request(Method::POST, "/messages/send")
            .await?
            .json(payload)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    /// 通用动作分发（{method, endpoint, payload}）
    pub async fn dispatch(
        &self,
        method: &str,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let method = Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| OpslinkError::InvalidArgument(format!("无效的 HTTP 方法: {}", method)))?;

        let mut builder = self.request(method.clone(), endpoint).await?;
        if method != Method::GET {
            builder = builder.json(payload);
        }

        let response = builder.send().await?;
        let response = Self::check_status(response).await?;

        if response.content_length() == Some(0) {
            return Ok(serde_json::Value::Null);
        }
        response
            .json()
            .await
            .or(Ok(serde_json::Value::Null))
    }

    /// 拉取一个轮询资源（GET {path}）
    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let response = self.request(Method::GET, path).await?.send().await?;
        let response = Self::check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| OpslinkError::Serialization(format!("解析轮询响应失败: {}", e)))
    }
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn push_outbound_batch(&self, items: &[OutboundItem]) -> Result<OutboundBatchResponse> {
        ApiClient::push_outbound_batch(self, items).await
    }

    async fn fetch_inbound(&self, since_ms: i64) -> Result<InboundBatch> {
        ApiClient::fetch_inbound(self, since_ms).await
    }

    async fn fetch_notifications(&self, since_ms: i64) -> Result<NotificationBatch> {
        ApiClient::fetch_notifications(self, since_ms).await
    }
}
