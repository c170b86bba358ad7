//! 事件系统模块 - 投递层各组件的状态广播
//!
//! 功能包括：
//! - 连接状态变更事件
//! - 队列统计与条目移除事件
//! - 同步生命周期事件
//! - 通知浮出/抑制事件与冲突解决事件
//! - 事件广播和订阅机制（丢弃接收端即退订）
//!
//! 网络问题没有抛错崩溃路径：组件内部自恢复，外部只能观察到这里的事件
//! 和各状态对象的字段变化。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::connection::health::{ConnectionMode, ConnectionState};
use crate::connection::InboundEvent;
use crate::notify::SuppressReason;
use crate::queue::{DropReason, MessageKind, QueueStats};
use crate::remote::RemoteNotification;
use crate::sync::{ConflictStrategy, SyncOutcome};

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SdkEvent {
    /// 连接状态变更（仅实际变化时广播）
    ConnectionStatusChanged {
        mode: ConnectionMode,
        state: ConnectionState,
        timestamp: i64,
    },
    /// 队列统计更新（每次队列变更后广播）
    QueueStatsUpdated {
        stats: QueueStats,
        timestamp: i64,
    },
    /// 消息投递成功
    MessageDelivered {
        id: String,
        kind: MessageKind,
        timestamp: i64,
    },
    /// 消息被移出队列（重试耗尽 / 过期 / 驱逐 / 清除）
    MessageDropped {
        id: String,
        kind: MessageKind,
        reason: DropReason,
        /// 最近一次失败的描述（重试耗尽时有值）
        error: Option<String>,
        timestamp: i64,
    },
    /// 一次同步完成
    SyncCompleted {
        outcome: SyncOutcome,
        timestamp: i64,
    },
    /// 一次同步失败（水位未前进，下次重拉同一区间）
    SyncFailed {
        error: String,
        timestamp: i64,
    },
    /// 通知通过频率控制，浮出给操作员
    NotificationSurfaced {
        notification: RemoteNotification,
        timestamp: i64,
    },
    /// 通知被频率控制抑制
    NotificationSuppressed {
        notification_type: String,
        reason: SuppressReason,
        timestamp: i64,
    },
    /// 冲突已解决
    ConflictResolved {
        item_id: String,
        strategy: ConflictStrategy,
        timestamp: i64,
    },
    /// 服务端推送/轮询拉回的入站事件
    RemoteEvent {
        event: InboundEvent,
        timestamp: i64,
    },
}

impl SdkEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SdkEvent::ConnectionStatusChanged { .. } => "connection_status_changed",
            SdkEvent::QueueStatsUpdated { .. } => "queue_stats_updated",
            SdkEvent::MessageDelivered { .. } => "message_delivered",
            SdkEvent::MessageDropped { .. } => "message_dropped",
            SdkEvent::SyncCompleted { .. } => "sync_completed",
            SdkEvent::SyncFailed { .. } => "sync_failed",
            SdkEvent::NotificationSurfaced { .. } => "notification_surfaced",
            SdkEvent::NotificationSuppressed { .. } => "notification_suppressed",
            SdkEvent::ConflictResolved { .. } => "conflict_resolved",
            SdkEvent::RemoteEvent { .. } => "remote_event",
        }
    }

    /// 获取事件时间戳
    pub fn timestamp(&self) -> i64 {
        match self {
            SdkEvent::ConnectionStatusChanged { timestamp, .. } => *timestamp,
            SdkEvent::QueueStatsUpdated { timestamp, .. } => *timestamp,
            SdkEvent::MessageDelivered { timestamp, .. } => *timestamp,
            SdkEvent::MessageDropped { timestamp, .. } => *timestamp,
            SdkEvent::SyncCompleted { timestamp, .. } => *timestamp,
            SdkEvent::SyncFailed { timestamp, .. } => *timestamp,
            SdkEvent::NotificationSurfaced { timestamp, .. } => *timestamp,
            SdkEvent::NotificationSuppressed { timestamp, .. } => *timestamp,
            SdkEvent::ConflictResolved { timestamp, .. } => *timestamp,
            SdkEvent::RemoteEvent { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

/// 事件总线
///
/// `subscribe()` 返回接收端句柄，丢弃句柄即退订。无订阅者时发布是空操作
/// （压测 / 无 UI 场景属正常情况，仅打 debug 日志）。
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SdkEvent>,
    stats: Arc<RwLock<EventStats>>,
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SdkEvent) {
        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        if let Err(e) = self.sender.send(event) {
            debug!("事件广播无活跃订阅者: {}", e);
        }
    }

    /// 订阅事件（丢弃返回的接收端即退订）
    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.sender.subscribe()
    }

    /// 活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// 获取事件统计
    pub fn stats(&self) -> EventStats {
        self.stats.read().clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
