//! 入站消息去重
//!
//! 基于 message id 的已见记录，入站条目写入本地前先查此表，重复条目静默丢弃。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

/// 去重缓存
///
/// 有界：超过清理阈值时顺带清除超过保留期的记录。
#[derive(Debug)]
pub struct DedupCache {
    /// 已写入的消息集合 (message_id -> 首见时间)
    seen: Mutex<HashMap<String, Instant>>,
    /// 记录保留时长
    retention: Duration,
    /// 清理阈值（超过此数量时触发清理）
    cleanup_threshold: usize,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_config(Duration::from_secs(3_600), 10_000)
    }

    /// 使用自定义配置创建
    pub fn with_config(retention: Duration, max_size: usize) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            retention,
            cleanup_threshold: max_size * 4 / 5, // 80% 阈值
        }
    }

    /// 检查消息是否已写入过（重复返回 true）
    pub fn is_duplicate(&self, message_id: &str) -> bool {
        let seen = self.seen.lock();
        if seen.contains_key(message_id) {
            debug!("🔄 检测到重复入站消息: message_id={}", message_id);
            return true;
        }
        false
    }

    /// 标记消息为已写入
    pub fn mark_seen(&self, message_id: &str) {
        let mut seen = self.seen.lock();
        seen.insert(message_id.to_string(), Instant::now());

        if seen.len() > self.cleanup_threshold {
            self.cleanup_internal(&mut seen);
        }
    }

    /// 内部清理（需要已持有锁）
    fn cleanup_internal(&self, seen: &mut HashMap<String, Instant>) {
        let now = Instant::now();
        let initial_count = seen.len();

        seen.retain(|_, first_seen| now.duration_since(*first_seen) <= self.retention);

        let removed = initial_count - seen.len();
        if removed > 0 {
            info!("🧹 清理过期去重记录: 移除 {} 条，剩余 {} 条", removed, seen.len());
        }
    }

    /// 当前记录数
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}
