use crate::queue::priority::MessagePriority;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// 出站工作单元的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// 通知（发往 POST /notifications/send）
    Notification,
    /// 聊天消息（发往 POST /messages/send）
    ChatMessage,
    /// 通用动作（{method, endpoint, payload} 形式的任意调用）
    GenericAction,
}

impl MessageKind {
    /// 各种类的默认最大重试次数
    ///
    /// 聊天消息用户直接感知，多重试；通用动作往往可由上层重新发起，少重试。
    pub fn default_max_retries(&self) -> u32 {
        match self {
            MessageKind::ChatMessage => 5,
            MessageKind::Notification => 4,
            MessageKind::GenericAction => 3,
        }
    }

    /// 获取种类的英文名称
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Notification => "notification",
            MessageKind::ChatMessage => "chat_message",
            MessageKind::GenericAction => "generic_action",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 种类专属的载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    Notification {
        /// 通知类型（频率控制按类型节流）
        notification_type: String,
        title: String,
        body: String,
    },
    ChatMessage {
        conversation_id: String,
        content: String,
        /// 附件 URL 列表
        #[serde(default)]
        attachments: Vec<String>,
    },
    GenericAction {
        /// HTTP 方法（GET/POST/PUT/DELETE）
        method: String,
        endpoint: String,
        payload: serde_json::Value,
    },
}

impl MessagePayload {
    /// 载荷对应的消息种类
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::Notification { .. } => MessageKind::Notification,
            MessagePayload::ChatMessage { .. } => MessageKind::ChatMessage,
            MessagePayload::GenericAction { .. } => MessageKind::GenericAction,
        }
    }
}

/// 队列消息 - 出站工作的基本单元
///
/// 不变量（由队列维护）：
/// - 在队列中的消息满足 `retry_count < max_retries`
/// - `expires_at` 缺省或在未来；过期条目由清扫任务移除，永不派发
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// 全局唯一 ID（uuid v4）
    pub id: String,
    pub kind: MessageKind,
    pub priority: MessagePriority,
    pub payload: MessagePayload,
    /// 创建时间（UTC 毫秒时间戳）
    pub created_at: i64,
    /// 过期时间（可选，UTC 毫秒时间戳）
    pub expires_at: Option<i64>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// 下次重试时间（投递失败后由退避策略写入；条目被移除即随之取消）
    pub next_retry_at: Option<i64>,
    /// 分类标签（用于过滤和批量清除）
    pub category: Option<String>,
    /// 归属者（用于过滤和批量清除）
    pub owner_id: Option<String>,
    /// 最近一次投递失败的描述
    pub last_error: Option<String>,
}

impl QueuedMessage {
    /// 创建新的队列消息
    ///
    /// 分配 uuid 与创建时间戳；`max_retries` 取种类默认值，可用
    /// [`with_max_retries`](Self::with_max_retries) 覆盖。
    pub fn new(payload: MessagePayload, priority: MessagePriority) -> Self {
        let kind = payload.kind();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            priority,
            payload,
            created_at: chrono::Utc::now().timestamp_millis(),
            expires_at: None,
            retry_count: 0,
            max_retries: kind.default_max_retries(),
            next_retry_at: None,
            category: None,
            owner_id: None,
            last_error: None,
        }
    }

    /// 设置过期时间（绝对时间，UTC 毫秒）
    pub fn with_expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// 设置存活时长（相对当前时间）
    pub fn with_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.expires_at = Some(chrono::Utc::now().timestamp_millis() + ttl_ms);
        self
    }

    /// 覆盖最大重试次数
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// 设置分类标签
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// 设置归属者
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// 检查消息是否已过期
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => chrono::Utc::now().timestamp_millis() > expires_at,
            None => false,
        }
    }

    /// 检查重试预算是否已耗尽
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// 检查当前是否可派发（未过期，且不在退避等待期内）
    pub fn is_dispatchable(&self, now_ms: i64) -> bool {
        if self.is_expired() {
            return false;
        }
        match self.next_retry_at {
            Some(next) => now_ms >= next,
            None => true,
        }
    }

    /// 消息年龄（毫秒）
    pub fn age_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.created_at
    }

    /// 消息大小估算（用于批量处理）
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(&self.payload).map(|v| v.len()).unwrap_or(0) + 128
    }
}

/// 消息被移出队列的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// 重试预算耗尽
    RetriesExhausted,
    /// 已过期
    Expired,
    /// 容量驱逐（队列满时为更高优先级条目让位）
    Evicted,
    /// 被批量清除
    Cleared,
}

/// 队列统计信息
///
/// 每次队列变更后随事件广播给订阅者。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// 当前待投递条目数
    pub pending: usize,
    /// 累计成功投递数
    pub delivered_total: u64,
    /// 累计投递失败次数（含进入重试的失败）
    pub failed_total: u64,
    /// 累计过期移除数
    pub expired_total: u64,
    /// 累计容量驱逐数
    pub evicted_total: u64,
    /// 累计重试耗尽丢弃数
    pub exhausted_total: u64,
    /// 按种类统计的待投递条目
    pub by_kind: HashMap<MessageKind, usize>,
    /// 按优先级统计的待投递条目
    pub by_priority: HashMap<MessagePriority, usize>,
    /// 按分类统计的待投递条目
    pub by_category: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_payload() -> MessagePayload {
        MessagePayload::ChatMessage {
            conversation_id: "conv_1".to_string(),
            content: "现场已处理完毕".to_string(),
            attachments: vec![],
        }
    }

    #[test]
    fn test_new_message_defaults() {
        let msg = QueuedMessage::new(chat_payload(), MessagePriority::High);

        assert_eq!(msg.kind, MessageKind::ChatMessage);
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.max_retries, 5);
        assert!(!msg.is_expired());
        assert!(!msg.retries_exhausted());
        assert!(msg.is_dispatchable(chrono::Utc::now().timestamp_millis()));
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn test_expired_message() {
        let msg = QueuedMessage::new(chat_payload(), MessagePriority::Low)
            .with_expires_at(chrono::Utc::now().timestamp_millis() - 1_000);

        assert!(msg.is_expired());
        assert!(!msg.is_dispatchable(chrono::Utc::now().timestamp_millis()));
    }

    #[test]
    fn test_backoff_gate() {
        let now = chrono::Utc::now().timestamp_millis();
        let mut msg = QueuedMessage::new(chat_payload(), MessagePriority::Medium);
        msg.next_retry_at = Some(now + 10_000);

        // 退避期内不可派发
        assert!(!msg.is_dispatchable(now));
        // 到点后可派发
        assert!(msg.is_dispatchable(now + 10_000));
    }

    #[test]
    fn test_payload_kind_matches() {
        let action = MessagePayload::GenericAction {
            method: "POST".to_string(),
            endpoint: "/bookings/123/confirm".to_string(),
            payload: serde_json::json!({"operator": "op_7"}),
        };
        assert_eq!(action.kind(), MessageKind::GenericAction);
        assert_eq!(MessageKind::GenericAction.default_max_retries(), 3);
    }
}
