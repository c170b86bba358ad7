use serde::{Deserialize, Serialize};
use std::fmt;

/// 消息优先级枚举
///
/// 优先级决定了消息在离线队列中的出队顺序：
/// - Urgent: 紧急，立即处理（告警确认、紧急工单操作）
/// - High: 高优先级，快速处理（聊天消息、派单响应）
/// - Medium: 普通优先级，正常处理（一般通知、状态上报）
/// - Low: 低优先级，可延迟处理（日志类动作、非关键回执）
///
/// 数值越小优先级越高，队列按此排序；同级之间保持入队顺序（稳定 FIFO）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MessagePriority {
    Urgent = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl MessagePriority {
    /// 获取优先级的数值
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// 从数值创建优先级
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessagePriority::Urgent),
            1 => Some(MessagePriority::High),
            2 => Some(MessagePriority::Medium),
            3 => Some(MessagePriority::Low),
            _ => None,
        }
    }

    /// 获取优先级的显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            MessagePriority::Urgent => "紧急",
            MessagePriority::High => "高",
            MessagePriority::Medium => "普通",
            MessagePriority::Low => "低",
        }
    }

    /// 获取优先级的英文名称
    pub fn name(&self) -> &'static str {
        match self {
            MessagePriority::Urgent => "urgent",
            MessagePriority::High => "high",
            MessagePriority::Medium => "medium",
            MessagePriority::Low => "low",
        }
    }

    /// 检查是否为高优先级（Urgent 或 High）
    ///
    /// 容量驱逐时，高优先级条目永远不会为低优先级条目让位。
    pub fn is_high_priority(&self) -> bool {
        matches!(self, MessagePriority::Urgent | MessagePriority::High)
    }

    /// 获取所有优先级的列表（从高到低）
    pub fn all() -> Vec<Self> {
        vec![
            MessagePriority::Urgent,
            MessagePriority::High,
            MessagePriority::Medium,
            MessagePriority::Low,
        ]
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Medium
    }
}

impl From<u8> for MessagePriority {
    fn from(value: u8) -> Self {
        MessagePriority::from_value(value).unwrap_or(MessagePriority::Medium)
    }
}

impl From<MessagePriority> for u8 {
    fn from(priority: MessagePriority) -> Self {
        priority.value()
    }
}
