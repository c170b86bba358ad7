//! 连接健康状态管理
//!
//! 提供进程内唯一的连接健康记录，包括：
//! - 当前传输模式与连接状态
//! - 延迟与成功/失败时间戳
//! - 连续失败与重连尝试计数
//!
//! 本记录只由连接管理器修改，其余组件只读快照。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 健康判定的新鲜度窗口：最近一次成功在 5 分钟内才算健康
pub const HEALTH_FRESHNESS_MS: i64 = 5 * 60 * 1_000;

/// 传输模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// 双工通道（WebSocket，支持服务端主动推送）
    Duplex,
    /// HTTP 轮询回退
    Polling,
    /// 未连接
    Disconnected,
}

impl ConnectionMode {
    /// 获取备选传输模式（模式级失败耗尽后切换的目标）
    pub fn alternate(&self) -> ConnectionMode {
        match self {
            ConnectionMode::Duplex => ConnectionMode::Polling,
            ConnectionMode::Polling => ConnectionMode::Duplex,
            ConnectionMode::Disconnected => ConnectionMode::Duplex,
        }
    }
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionMode::Duplex => write!(f, "双工通道"),
            ConnectionMode::Polling => write!(f, "HTTP 轮询"),
            ConnectionMode::Disconnected => write!(f, "未连接"),
        }
    }
}

/// 连接状态
///
/// 状态机：disconnected → connecting → connected；
/// connected → reconnecting →（成功）connected /（尝试耗尽）failed；
/// failed → 备选模式 connecting（强制切换）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "未连接"),
            ConnectionState::Connecting => write!(f, "连接中"),
            ConnectionState::Connected => write!(f, "已连接"),
            ConnectionState::Reconnecting => write!(f, "重连中"),
            ConnectionState::Failed => write!(f, "连接失败"),
        }
    }
}

/// 连接健康记录（进程内唯一）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub mode: ConnectionMode,
    pub state: ConnectionState,
    /// 最近一次测得的延迟（毫秒）
    pub latency_ms: Option<u64>,
    /// 最近一次成功时间（UTC 毫秒时间戳）
    pub last_success_at: Option<i64>,
    /// 最近一次失败时间（UTC 毫秒时间戳）
    pub last_failure_at: Option<i64>,
    /// 连续失败次数（成功即清零）
    pub consecutive_failures: u32,
    /// 当前模式下的重连尝试次数
    pub reconnect_attempts: u32,
    /// 最近一次失败的描述
    pub last_error: Option<String>,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self {
            mode: ConnectionMode::Disconnected,
            state: ConnectionState::Disconnected,
            latency_ms: None,
            last_success_at: None,
            last_failure_at: None,
            consecutive_failures: 0,
            reconnect_attempts: 0,
            last_error: None,
        }
    }

    /// 派生的健康标志
    ///
    /// 仅当 state = connected 且最近一次成功在新鲜度窗口内为 true。
    pub fn is_healthy(&self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        match self.last_success_at {
            Some(at) => Utc::now().timestamp_millis() - at <= HEALTH_FRESHNESS_MS,
            None => false,
        }
    }

    /// 生成状态摘要（用于日志打印）
    pub fn summary(&self) -> String {
        format!(
            "模式: {}, 状态: {}, 延迟: {}, 连续失败: {}, 重连尝试: {}",
            self.mode,
            self.state,
            self.latency_ms.map(|l| format!("{}ms", l)).unwrap_or_else(|| "未知".to_string()),
            self.consecutive_failures,
            self.reconnect_attempts,
        )
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// 连接健康管理器（线程安全）
///
/// 写入只来自连接管理器；其他组件通过 [`snapshot`](Self::snapshot) 只读。
#[derive(Debug, Clone)]
pub struct HealthManager {
    health: Arc<RwLock<ConnectionHealth>>,
}

impl HealthManager {
    pub fn new() -> Self {
        Self {
            health: Arc::new(RwLock::new(ConnectionHealth::new())),
        }
    }

    /// 记录一次状态转移，返回是否发生了实际变化
    ///
    /// 只有实际变化才应通知订阅者。
    pub async fn update_status(
        &self,
        mode: ConnectionMode,
        state: ConnectionState,
        error: Option<String>,
    ) -> bool {
        let mut health = self.health.write().await;
        let changed = health.mode != mode || health.state != state;
        health.mode = mode;
        health.state = state;
        if let Some(err) = error {
            health.last_error = Some(err);
        }
        changed
    }

    /// 记录一次成功：清零失败/重连计数，标记已连接
    pub async fn record_success(&self, mode: ConnectionMode, latency_ms: u64) {
        let mut health = self.health.write().await;
        health.mode = mode;
        health.state = ConnectionState::Connected;
        health.latency_ms = Some(latency_ms);
        health.last_success_at = Some(Utc::now().timestamp_millis());
        health.consecutive_failures = 0;
        health.reconnect_attempts = 0;
        health.last_error = None;
    }

    /// 记录一次失败，返回失败后的连续失败次数
    pub async fn record_failure(&self, mode: ConnectionMode, error: &str) -> u32 {
        let mut health = self.health.write().await;
        health.mode = mode;
        health.last_failure_at = Some(Utc::now().timestamp_millis());
        health.consecutive_failures += 1;
        health.last_error = Some(error.to_string());
        health.consecutive_failures
    }

    /// 增加重连尝试计数，返回新值
    pub async fn bump_reconnect_attempts(&self) -> u32 {
        let mut health = self.health.write().await;
        health.reconnect_attempts += 1;
        health.reconnect_attempts
    }

    /// 重置重连尝试计数（模式切换时调用）
    pub async fn reset_reconnect_attempts(&self) {
        let mut health = self.health.write().await;
        health.reconnect_attempts = 0;
    }

    /// 重置连续失败计数（模式切换后新传输有自己的失败预算）
    pub async fn reset_consecutive_failures(&self) {
        let mut health = self.health.write().await;
        health.consecutive_failures = 0;
    }

    /// 获取当前健康快照
    pub async fn snapshot(&self) -> ConnectionHealth {
        self.health.read().await.clone()
    }

    /// 当前是否在线（状态为已连接）
    pub async fn is_online(&self) -> bool {
        self.health.read().await.state == ConnectionState::Connected
    }
}

impl Default for HealthManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_transitions() {
        let manager = HealthManager::new();

        let changed = manager
            .update_status(ConnectionMode::Duplex, ConnectionState::Connecting, None)
            .await;
        assert!(changed);

        // 同样的状态不算变化
        let changed = manager
            .update_status(ConnectionMode::Duplex, ConnectionState::Connecting, None)
            .await;
        assert!(!changed);

        manager.record_success(ConnectionMode::Duplex, 42).await;
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(snapshot.latency_ms, Some(42));
        assert!(snapshot.is_healthy());
    }

    #[tokio::test]
    async fn test_failure_counting() {
        let manager = HealthManager::new();

        assert_eq!(manager.record_failure(ConnectionMode::Duplex, "超时").await, 1);
        assert_eq!(manager.record_failure(ConnectionMode::Duplex, "超时").await, 2);
        assert_eq!(manager.record_failure(ConnectionMode::Duplex, "超时").await, 3);

        // 成功清零连续失败
        manager.record_success(ConnectionMode::Duplex, 10).await;
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.reconnect_attempts, 0);
    }

    #[test]
    fn test_unhealthy_when_stale() {
        let mut health = ConnectionHealth::new();
        health.state = ConnectionState::Connected;
        // 成功时间早于新鲜度窗口
        health.last_success_at =
            Some(Utc::now().timestamp_millis() - HEALTH_FRESHNESS_MS - 1_000);
        assert!(!health.is_healthy());
    }

    #[test]
    fn test_alternate_mode() {
        assert_eq!(ConnectionMode::Duplex.alternate(), ConnectionMode::Polling);
        assert_eq!(ConnectionMode::Polling.alternate(), ConnectionMode::Duplex);
    }
}
