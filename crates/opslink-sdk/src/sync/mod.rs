//! 状态对账模块
//!
//! 职责：
//! - 断线恢复后（以及固定节奏下）对账本地与远端状态
//! - 管理入站水位（watermark）
//! - 入站去重与冲突的确定性解决

pub mod conflict;
pub mod dedup;
pub mod service;
pub mod watermark;

pub use conflict::{ConflictHandler, ConflictResolution, ConflictStrategy};
pub use dedup::DedupCache;
pub use service::{MessageSyncService, SyncServiceConfig};
pub use watermark::WatermarkManager;

use serde::{Deserialize, Serialize};

/// 同步模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// 全量：先清空出站队列，再拉取入站与通知增量
    Full,
    /// 增量：只拉取入站增量（出站由队列持续排空）
    Incremental,
}

/// 一次同步调用的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOutcome {
    /// 完成
    Completed {
        mode: SyncMode,
        /// 出站批量同步的条目数
        pushed: usize,
        /// 写入本地的入站条目数（去重后）
        pulled: usize,
        /// 浮出的通知数
        notifications: usize,
        /// 解决的冲突数
        conflicts: usize,
    },
    /// 已有同步在进行中，本次调用为空操作
    Skipped,
}

/// 对账状态
///
/// 同一时刻至多一次同步在进行（互斥由服务内部的忙标志保证）。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    /// 最近一次成功同步的时间（UTC 毫秒时间戳）
    pub last_sync_at: Option<i64>,
    /// 出站队列中的待投递条目数
    pub pending_count: usize,
    pub sync_in_progress: bool,
    /// 最近一次同步失败的描述（成功后清除）
    pub last_sync_error: Option<String>,
}
