use serde::{Deserialize, Serialize};

use crate::error::OpslinkError;

/// 投递失败原因分类
///
/// 瞬时网络类失败走退避重试；远端对具体条目的拒绝计入该条目的重试预算，
/// 与传输层健康无关。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DeliveryFailureReason {
    /// 网络超时 - 可重试
    NetworkTimeout,
    /// 网络不可用（离线 / 传输断开）- 等待恢复后重试
    NetworkUnavailable,
    /// 服务端错误 - 根据状态码决定
    ServerError(u16),
    /// 限流 - 延迟重试
    RateLimited,
    /// 载荷过大 - 不重试
    PayloadTooLarge,
    /// 权限不足 - 不重试
    Forbidden,
    /// 未知错误
    Unknown(String),
}

impl DeliveryFailureReason {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryFailureReason::NetworkTimeout => true,
            DeliveryFailureReason::NetworkUnavailable => true,
            DeliveryFailureReason::ServerError(code) => {
                // 5xx 服务端错误可重试，4xx 客户端错误不重试
                *code >= 500 && *code < 600
            }
            DeliveryFailureReason::RateLimited => true,
            DeliveryFailureReason::PayloadTooLarge => false,
            DeliveryFailureReason::Forbidden => false,
            DeliveryFailureReason::Unknown(_) => true, // 保守策略：未知错误可重试
        }
    }

    /// 从 HTTP 状态码分类
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => DeliveryFailureReason::NetworkTimeout,
            429 => DeliveryFailureReason::RateLimited,
            403 => DeliveryFailureReason::Forbidden,
            413 => DeliveryFailureReason::PayloadTooLarge,
            code => DeliveryFailureReason::ServerError(code),
        }
    }
}

impl From<&OpslinkError> for DeliveryFailureReason {
    fn from(error: &OpslinkError) -> Self {
        match error {
            OpslinkError::Timeout(_) => DeliveryFailureReason::NetworkTimeout,
            OpslinkError::NotConnected => DeliveryFailureReason::NetworkUnavailable,
            OpslinkError::Transport(msg) => {
                if msg.contains("timeout") {
                    DeliveryFailureReason::NetworkTimeout
                } else {
                    DeliveryFailureReason::NetworkUnavailable
                }
            }
            OpslinkError::DeliveryRejected { status, .. } => {
                DeliveryFailureReason::from_status(*status)
            }
            other => DeliveryFailureReason::Unknown(other.to_string()),
        }
    }
}

/// 投递重试策略
///
/// 与连接层的重连退避是两套独立配置的策略：本策略作用于队列内单个条目，
/// 重连退避作用于整个传输。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRetryPolicy {
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
}

impl Default for DeliveryRetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000, // 30 秒封顶
            backoff_factor: 2.0,
        }
    }
}

impl DeliveryRetryPolicy {
    /// 计算第 `retry_count` 次失败后的退避延迟（毫秒）
    ///
    /// delay = base * factor^retry_count，封顶 max
    pub fn delay_for_retry(&self, retry_count: u32) -> u64 {
        let delay = self.base_delay_ms as f64 * self.backoff_factor.powf(retry_count as f64);
        (delay as u64).min(self.max_delay_ms)
    }

    /// 计算下次重试的绝对时间（UTC 毫秒时间戳）
    ///
    /// 不可重试的失败原因或预算耗尽返回 None（条目应被移除）。
    pub fn next_retry_at(
        &self,
        retry_count: u32,
        max_retries: u32,
        failure_reason: &DeliveryFailureReason,
    ) -> Option<i64> {
        if retry_count >= max_retries || !failure_reason.is_retryable() {
            return None;
        }

        let delay = self.delay_for_retry(retry_count);
        Some(chrono::Utc::now().timestamp_millis() + delay as i64)
    }
}
