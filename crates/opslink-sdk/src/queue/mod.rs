//! 离线消息队列
//!
//! 保证断线期间的出站工作单元不丢失：按优先级 + FIFO 排序、容量驱逐、
//! 投递失败退避重试、过期清扫。每次变更整快照持久化到 KV 存储，并向
//! 订阅者广播最新统计。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{OpslinkError, Result};
use crate::events::{EventBus, SdkEvent};
use crate::storage::{keys, KvStore};

pub mod message;
pub mod priority;
pub mod retry_policy;

pub use message::{DropReason, MessageKind, MessagePayload, QueuedMessage, QueueStats};
pub use priority::MessagePriority;
pub use retry_policy::{DeliveryFailureReason, DeliveryRetryPolicy};

/// 出站投递口 - 队列通过它调用连接管理器的活动传输
///
/// 调用方不感知当前是双工通道还是轮询回退。
#[async_trait]
pub trait MessageDispatcher: Send + Sync + std::fmt::Debug {
    /// 当前是否在线（离线时排空是空操作）
    async fn is_online(&self) -> bool;

    /// 投递一条消息
    async fn dispatch(&self, message: &QueuedMessage) -> Result<()>;
}

/// 离线队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueueConfig {
    /// 队列容量上限
    pub capacity: usize,
    /// 单次排空的批量大小
    pub drain_batch_size: usize,
    /// 排空工作循环的兜底间隔（秒），覆盖退避到点的条目
    pub drain_interval_secs: u64,
    /// 过期清扫间隔（秒），独立于排空节奏
    pub sweep_interval_secs: u64,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            drain_batch_size: 10,
            drain_interval_secs: 5,
            sweep_interval_secs: 60,
        }
    }
}

/// 批量清除的过滤器；所有条件为 AND，全空则匹配一切
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub kind: Option<MessageKind>,
    pub priority: Option<MessagePriority>,
    pub category: Option<String>,
    pub owner_id: Option<String>,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// 检查消息是否匹配过滤器
    pub fn matches(&self, message: &QueuedMessage) -> bool {
        if let Some(kind) = self.kind {
            if message.kind != kind {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if message.priority != priority {
                return false;
            }
        }
        if let Some(ref category) = self.category {
            if message.category.as_deref() != Some(category.as_str()) {
                return false;
            }
        }
        if let Some(ref owner_id) = self.owner_id {
            if message.owner_id.as_deref() != Some(owner_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// 一次排空的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// 本次派发的条目数
    pub dispatched: usize,
    /// 投递成功数
    pub delivered: usize,
    /// 投递失败（进入重试）数
    pub retried: usize,
    /// 被移除（重试耗尽 / 不可重试）数
    pub dropped: usize,
    /// 因已有排空在进行而跳过
    pub skipped: bool,
}

/// 累计计数器（跨排空保留）
#[derive(Debug, Clone, Copy, Default)]
struct QueueCounters {
    delivered: u64,
    failed: u64,
    expired: u64,
    evicted: u64,
    exhausted: u64,
}

/// 离线消息队列
#[derive(Debug)]
pub struct OfflineQueue {
    config: OfflineQueueConfig,
    /// 条目按优先级值升序 + 同级入队顺序维护（紧急在前）
    entries: Arc<RwLock<Vec<QueuedMessage>>>,
    /// 排空忙标志（非重入保护）
    draining: AtomicBool,
    /// 清扫忙标志
    sweeping: AtomicBool,
    counters: parking_lot::RwLock<QueueCounters>,
    policy: DeliveryRetryPolicy,
    kv: Arc<KvStore>,
    dispatcher: Arc<dyn MessageDispatcher>,
    events: EventBus,
    /// 入队时唤醒排空工作循环
    drain_tx: mpsc::Sender<()>,
    /// 排空工作循环启动时取走
    drain_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl OfflineQueue {
    /// 从 KV 存储加载队列快照并构造队列
    ///
    /// 加载时丢弃违反不变量的条目（已过期或重试耗尽）。
    pub async fn load(
        config: OfflineQueueConfig,
        policy: DeliveryRetryPolicy,
        kv: Arc<KvStore>,
        dispatcher: Arc<dyn MessageDispatcher>,
        events: EventBus,
    ) -> Result<Self> {
        let snapshot: Vec<QueuedMessage> = kv.get(keys::QUEUE_SNAPSHOT).await?.unwrap_or_default();

        let before = snapshot.len();
        let mut entries: Vec<QueuedMessage> = snapshot
            .into_iter()
            .filter(|m| !m.is_expired() && !m.retries_exhausted())
            .collect();
        entries.sort_by_key(|m| m.priority.value());
        if before != entries.len() {
            info!("队列加载时丢弃 {} 条失效条目", before - entries.len());
        }
        info!("离线队列已加载: {} 条待投递", entries.len());

        let (drain_tx, drain_rx) = mpsc::channel(8);
        Ok(Self {
            config,
            entries: Arc::new(RwLock::new(entries)),
            draining: AtomicBool::new(false),
            sweeping: AtomicBool::new(false),
            counters: parking_lot::RwLock::new(QueueCounters::default()),
            policy,
            kv,
            dispatcher,
            events,
            drain_tx,
            drain_rx: Mutex::new(Some(drain_rx)),
        })
    }

    /// 入队一条消息，返回其 ID
    ///
    /// 插入位置保持"优先级值升序 + 同级 FIFO"；队列满时按驱逐规则为
    /// 新条目腾位；当前在线则立即唤醒排空。
    pub async fn enqueue(&self, message: QueuedMessage) -> Result<String> {
        if message.is_expired() {
            return Err(OpslinkError::InvalidArgument(
                "消息的过期时间已在过去".to_string(),
            ));
        }

        let id = message.id.clone();
        {
            let mut entries = self.entries.write().await;

            // 容量驱逐：候选为最低优先级档中最老的一条；候选优先级严格低于
            // 新条目才驱逐，绝不驱逐 urgent/high 为 low 腾位
            if entries.len() >= self.config.capacity {
                let worst = entries.last().map(|m| m.priority).unwrap_or(message.priority);
                if worst.value() > message.priority.value() {
                    // 最低优先级档中最老的一条就是该档的第一个
                    let victim_index = entries
                        .iter()
                        .position(|m| m.priority == worst)
                        .unwrap_or(entries.len() - 1);
                    let victim = entries.remove(victim_index);
                    warn!(
                        "队列已满，驱逐最低优先级条目: id={}, priority={}",
                        victim.id, victim.priority
                    );
                    self.counters.write().evicted += 1;
                    self.events.emit(SdkEvent::MessageDropped {
                        id: victim.id,
                        kind: victim.kind,
                        reason: DropReason::Evicted,
                        error: None,
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    });
                } else {
                    warn!(
                        "队列已满且无可驱逐条目（新条目 priority={}），拒绝入队",
                        message.priority
                    );
                    return Err(OpslinkError::QueueFull(format!(
                        "容量 {} 已满",
                        self.config.capacity
                    )));
                }
            }

            // 同级 FIFO：插到最后一个优先级值 <= 新条目的位置之后
            let pos = entries.partition_point(|m| m.priority.value() <= message.priority.value());
            debug!("消息入队: id={}, priority={}, 位置={}", id, message.priority, pos);
            entries.insert(pos, message);
        }

        self.persist_and_notify().await;

        // 在线则唤醒排空工作循环（未启动时为空操作，不阻塞调用方）
        if self.dispatcher.is_online().await {
            let _ = self.drain_tx.try_send(());
        }

        Ok(id)
    }

    /// 排空工作循环（由 SDK 门面在启动时挂起，关停时取消）
    ///
    /// 入队唤醒 + 兜底间隔双驱动；兜底间隔覆盖退避到点的重试条目。
    pub async fn run_drain_worker(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = {
            let mut guard = self.drain_rx.lock().await;
            match guard.take() {
                Some(rx) => rx,
                None => {
                    error!("排空工作循环重复启动");
                    return;
                }
            }
        };

        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.drain_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_nudge = rx.recv() => {
                    if maybe_nudge.is_none() {
                        break;
                    }
                    if let Err(e) = self.drain().await {
                        error!("排空失败: {}", e);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.drain().await {
                        error!("排空失败: {}", e);
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("排空工作循环退出");
                    break;
                }
            }
        }
    }

    /// 排空一批待投递条目
    ///
    /// 非重入：已有排空在进行时本次调用直接返回 skipped。批内条目并发
    /// 派发并在下一轮前合流。
    pub async fn drain(&self) -> Result<DrainReport> {
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("已有排空在进行，跳过");
            return Ok(DrainReport {
                skipped: true,
                ..Default::default()
            });
        }

        let result = self.drain_inner().await;
        self.draining.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_inner(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        if !self.dispatcher.is_online().await {
            debug!("当前离线，排空为空操作");
            return Ok(report);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let batch: Vec<QueuedMessage> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|m| m.is_dispatchable(now))
                .take(self.config.drain_batch_size)
                .cloned()
                .collect()
        };

        if batch.is_empty() {
            return Ok(report);
        }

        report.dispatched = batch.len();
        debug!("排空批次: {} 条", batch.len());

        // 批内并发派发，合流后统一应用结果
        let outcomes = futures::future::join_all(
            batch.iter().map(|message| self.dispatcher.dispatch(message)),
        )
        .await;

        {
            let mut entries = self.entries.write().await;
            for (message, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => {
                        entries.retain(|m| m.id != message.id);
                        report.delivered += 1;
                        self.counters.write().delivered += 1;
                        self.events.emit(SdkEvent::MessageDelivered {
                            id: message.id.clone(),
                            kind: message.kind,
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        });
                    }
                    Err(err) => {
                        let reason = DeliveryFailureReason::from(&err);
                        self.counters.write().failed += 1;

                        let Some(entry) = entries.iter_mut().find(|m| m.id == message.id) else {
                            continue;
                        };
                        entry.retry_count += 1;
                        entry.last_error = Some(err.to_string());

                        match self.policy.next_retry_at(
                            entry.retry_count,
                            entry.max_retries,
                            &reason,
                        ) {
                            // 预算耗尽或不可重试：移除并上报
                            None => {
                                let dropped = entry.clone();
                                entries.retain(|m| m.id != dropped.id);
                                report.dropped += 1;
                                self.counters.write().exhausted += 1;
                                warn!(
                                    "条目重试耗尽，移除: id={}, retry_count={}, 原因={:?}",
                                    dropped.id, dropped.retry_count, reason
                                );
                                self.events.emit(SdkEvent::MessageDropped {
                                    id: dropped.id,
                                    kind: dropped.kind,
                                    reason: DropReason::RetriesExhausted,
                                    error: dropped.last_error,
                                    timestamp: chrono::Utc::now().timestamp_millis(),
                                });
                            }
                            // 投递退避：1000 * 2^retry_count，30s 封顶
                            Some(next_retry_at) => {
                                entry.next_retry_at = Some(next_retry_at);
                                report.retried += 1;
                                debug!(
                                    "条目投递失败，退避至 {}: id={}, retry_count={}",
                                    next_retry_at, entry.id, entry.retry_count
                                );
                            }
                        }
                    }
                }
            }
        }

        self.persist_and_notify().await;
        Ok(report)
    }

    /// 批量清除，返回移除的条目数
    ///
    /// 不带过滤器时清空整个队列。
    pub async fn clear(&self, filter: Option<MessageFilter>) -> Result<usize> {
        let removed: Vec<QueuedMessage> = {
            let mut entries = self.entries.write().await;
            let filter = filter.unwrap_or_default();
            let (matched, kept): (Vec<_>, Vec<_>) =
                entries.drain(..).partition(|m| filter.matches(m));
            *entries = kept;
            matched
        };

        for message in &removed {
            self.events.emit(SdkEvent::MessageDropped {
                id: message.id.clone(),
                kind: message.kind,
                reason: DropReason::Cleared,
                error: None,
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
        }

        if !removed.is_empty() {
            info!("批量清除 {} 条队列条目", removed.len());
            self.persist_and_notify().await;
        }
        Ok(removed.len())
    }

    /// 过期清扫：移除所有已过期条目，返回移除数
    ///
    /// 与排空相互独立，各自有忙标志，可被定时器并发触发而不重入。
    pub async fn sweep_expired(&self) -> Result<usize> {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        let removed: Vec<QueuedMessage> = {
            let mut entries = self.entries.write().await;
            let (expired, kept): (Vec<_>, Vec<_>) =
                entries.drain(..).partition(|m| m.is_expired());
            *entries = kept;
            expired
        };

        for message in &removed {
            self.counters.write().expired += 1;
            self.events.emit(SdkEvent::MessageDropped {
                id: message.id.clone(),
                kind: message.kind,
                reason: DropReason::Expired,
                error: None,
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
        }

        if !removed.is_empty() {
            debug!("过期清扫移除 {} 条", removed.len());
            self.persist_and_notify().await;
        }

        self.sweeping.store(false, Ordering::SeqCst);
        Ok(removed.len())
    }

    /// 过期清扫循环（由 SDK 门面在启动时挂起，关停时取消）
    pub async fn run_sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.sweep_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_expired().await {
                        error!("过期清扫失败: {}", e);
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("过期清扫循环退出");
                    break;
                }
            }
        }
    }

    /// 当前待投递条目数
    pub async fn pending_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// 取待投递条目的快照（优先级顺序；全量同步的出站阶段用）
    pub async fn snapshot(&self) -> Vec<QueuedMessage> {
        self.entries.read().await.clone()
    }

    /// 按 ID 移除一批条目（出站批量同步成功后调用）
    pub async fn remove_delivered(&self, ids: &[String]) -> Result<usize> {
        let removed = {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|m| !ids.contains(&m.id));
            before - entries.len()
        };

        if removed > 0 {
            self.counters.write().delivered += removed as u64;
            self.persist_and_notify().await;
        }
        Ok(removed)
    }

    /// 计算当前统计信息
    pub async fn stats(&self) -> QueueStats {
        let entries = self.entries.read().await;
        let counters = *self.counters.read();

        let mut stats = QueueStats {
            pending: entries.len(),
            delivered_total: counters.delivered,
            failed_total: counters.failed,
            expired_total: counters.expired,
            evicted_total: counters.evicted,
            exhausted_total: counters.exhausted,
            ..Default::default()
        };

        for message in entries.iter() {
            *stats.by_kind.entry(message.kind).or_insert(0) += 1;
            *stats.by_priority.entry(message.priority).or_insert(0) += 1;
            if let Some(category) = &message.category {
                *stats.by_category.entry(category.clone()).or_insert(0) += 1;
            }
        }
        stats
    }

    /// 整快照持久化并广播统计
    ///
    /// 存储写入彻底失败是唯一视为不可恢复的情况：记日志，不无限重试。
    async fn persist_and_notify(&self) {
        let snapshot = self.entries.read().await.clone();
        if let Err(e) = self.kv.set(keys::QUEUE_SNAPSHOT, &snapshot).await {
            error!("队列快照持久化失败（不可恢复）: {}", e);
        }

        let stats = self.stats().await;
        self.events.emit(SdkEvent::QueueStatsUpdated {
            stats,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use std::collections::HashMap;

    /// 测试用投递口：可脚本化在线状态与每条消息的失败次数
    #[derive(Debug, Default)]
    pub struct MockDispatcher {
        online: AtomicBool,
        /// message_id -> 剩余失败次数（耗尽后成功）
        failures: parking_lot::Mutex<HashMap<String, u32>>,
        /// 永远失败的开关
        always_fail: AtomicBool,
        pub dispatched: parking_lot::Mutex<Vec<String>>,
    }

    impl MockDispatcher {
        pub fn online() -> Self {
            let dispatcher = Self::default();
            dispatcher.online.store(true, Ordering::SeqCst);
            dispatcher
        }

        pub fn offline() -> Self {
            Self::default()
        }

        pub fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        pub fn fail_times(&self, message_id: &str, times: u32) {
            self.failures.lock().insert(message_id.to_string(), times);
        }

        pub fn set_always_fail(&self, fail: bool) {
            self.always_fail.store(fail, Ordering::SeqCst);
        }

        pub fn dispatched_ids(&self) -> Vec<String> {
            self.dispatched.lock().clone()
        }
    }

    #[async_trait]
    impl MessageDispatcher for MockDispatcher {
        async fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        async fn dispatch(&self, message: &QueuedMessage) -> Result<()> {
            self.dispatched.lock().push(message.id.clone());

            if self.always_fail.load(Ordering::SeqCst) {
                return Err(OpslinkError::Timeout("模拟超时".to_string()));
            }

            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(&message.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(OpslinkError::Timeout("模拟超时".to_string()));
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_helpers::MockDispatcher;
    use super::*;
    use tempfile::TempDir;

    async fn queue_with(
        dispatcher: Arc<MockDispatcher>,
        config: OfflineQueueConfig,
    ) -> (Arc<OfflineQueue>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());
        let queue = OfflineQueue::load(
            config,
            DeliveryRetryPolicy::default(),
            kv,
            dispatcher,
            EventBus::new(64),
        )
        .await
        .unwrap();
        (Arc::new(queue), temp_dir)
    }

    fn chat(content: &str, priority: MessagePriority) -> QueuedMessage {
        QueuedMessage::new(
            MessagePayload::ChatMessage {
                conversation_id: "conv".to_string(),
                content: content.to_string(),
                attachments: vec![],
            },
            priority,
        )
    }

    #[tokio::test]
    async fn test_priority_then_fifo_ordering() {
        let dispatcher = Arc::new(MockDispatcher::offline());
        let (queue, _dir) = queue_with(dispatcher.clone(), OfflineQueueConfig::default()).await;

        let low_1 = queue.enqueue(chat("low-1", MessagePriority::Low)).await.unwrap();
        let low_2 = queue.enqueue(chat("low-2", MessagePriority::Low)).await.unwrap();
        let urgent = queue.enqueue(chat("urgent", MessagePriority::Urgent)).await.unwrap();
        let medium = queue.enqueue(chat("medium", MessagePriority::Medium)).await.unwrap();

        // 上线排空：严格按 紧急 > 普通 > 低，同级 FIFO
        dispatcher.set_online(true);
        let report = queue.drain().await.unwrap();
        assert_eq!(report.delivered, 4);
        assert_eq!(dispatcher.dispatched_ids(), vec![urgent, medium, low_1, low_2]);
    }

    #[tokio::test]
    async fn test_offline_drain_is_noop() {
        let dispatcher = Arc::new(MockDispatcher::offline());
        let (queue, _dir) = queue_with(dispatcher.clone(), OfflineQueueConfig::default()).await;

        queue.enqueue(chat("hello", MessagePriority::High)).await.unwrap();
        let report = queue.drain().await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(queue.pending_count().await, 1);
        assert!(dispatcher.dispatched_ids().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_never_evicts_high_for_low() {
        let dispatcher = Arc::new(MockDispatcher::offline());
        let config = OfflineQueueConfig {
            capacity: 2,
            ..Default::default()
        };
        let (queue, _dir) = queue_with(dispatcher, config).await;

        queue.enqueue(chat("u1", MessagePriority::Urgent)).await.unwrap();
        queue.enqueue(chat("h1", MessagePriority::High)).await.unwrap();

        // 队列满，低优先级进不来（不得驱逐 urgent/high）
        let result = queue.enqueue(chat("l1", MessagePriority::Low)).await;
        assert!(matches!(result, Err(OpslinkError::QueueFull(_))));
        assert_eq!(queue.pending_count().await, 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_low_first() {
        let dispatcher = Arc::new(MockDispatcher::offline());
        let config = OfflineQueueConfig {
            capacity: 3,
            ..Default::default()
        };
        let (queue, _dir) = queue_with(dispatcher.clone(), config).await;

        let low_old = queue.enqueue(chat("low-old", MessagePriority::Low)).await.unwrap();
        let low_new = queue.enqueue(chat("low-new", MessagePriority::Low)).await.unwrap();
        queue.enqueue(chat("h", MessagePriority::High)).await.unwrap();

        // 满队列来了一条普通优先级：驱逐最老的低优先级条目
        queue.enqueue(chat("m", MessagePriority::Medium)).await.unwrap();

        let snapshot = queue.snapshot().await;
        let ids: Vec<&str> = snapshot.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(snapshot.len(), 3);
        assert!(!ids.contains(&low_old.as_str()));
        assert!(ids.contains(&low_new.as_str()));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_removes_entry() {
        let dispatcher = Arc::new(MockDispatcher::online());
        dispatcher.set_always_fail(true);
        let (queue, _dir) = queue_with(dispatcher.clone(), OfflineQueueConfig::default()).await;

        let msg = chat("will-fail", MessagePriority::High).with_max_retries(3);
        let id = msg.id.clone();
        // 直接注入避免 enqueue 自动触发的后台排空引入时序
        {
            let mut entries = queue.entries.write().await;
            entries.push(msg);
        }

        // 3 次失败后条目被移除
        for _ in 0..3 {
            // 清掉退避门限，让下一轮立即可派发
            {
                let mut entries = queue.entries.write().await;
                for entry in entries.iter_mut() {
                    entry.next_retry_at = None;
                }
            }
            queue.drain().await.unwrap();
        }

        assert_eq!(queue.pending_count().await, 0);

        // 后续排空不再出现
        queue.drain().await.unwrap();
        assert_eq!(
            dispatcher.dispatched_ids().iter().filter(|i| **i == id).count(),
            3
        );
    }

    #[tokio::test]
    async fn test_failed_entry_gets_backoff() {
        let dispatcher = Arc::new(MockDispatcher::online());
        let (queue, _dir) = queue_with(dispatcher.clone(), OfflineQueueConfig::default()).await;

        let msg = chat("retry-later", MessagePriority::Medium);
        let id = msg.id.clone();
        dispatcher.fail_times(&id, 1);
        {
            let mut entries = queue.entries.write().await;
            entries.push(msg);
        }

        let report = queue.drain().await.unwrap();
        assert_eq!(report.retried, 1);

        // 退避期内第二次排空不会再派发它
        let report = queue.drain().await.unwrap();
        assert_eq!(report.dispatched, 0);

        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot[0].retry_count, 1);
        assert!(snapshot[0].next_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_expired_entry_swept_not_dispatched() {
        let dispatcher = Arc::new(MockDispatcher::online());
        let (queue, _dir) = queue_with(dispatcher.clone(), OfflineQueueConfig::default()).await;

        let expired = chat("stale", MessagePriority::High)
            .with_expires_at(chrono::Utc::now().timestamp_millis() - 1);
        {
            let mut entries = queue.entries.write().await;
            entries.push(expired);
        }

        // 过期条目不会被派发
        let report = queue.drain().await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert!(dispatcher.dispatched_ids().is_empty());

        // 清扫将其移除
        let swept = queue.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_clear_with_filter() {
        let dispatcher = Arc::new(MockDispatcher::offline());
        let (queue, _dir) = queue_with(dispatcher, OfflineQueueConfig::default()).await;

        queue
            .enqueue(chat("a", MessagePriority::Low).with_category("alerts"))
            .await
            .unwrap();
        queue
            .enqueue(chat("b", MessagePriority::Low).with_category("bookings"))
            .await
            .unwrap();
        queue.enqueue(chat("c", MessagePriority::High)).await.unwrap();

        let removed = queue
            .clear(Some(MessageFilter::new().with_category("alerts")))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.pending_count().await, 2);

        // 无过滤器清空全部
        let removed = queue.clear(None).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_snapshot_persists_across_reload() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());
        let dispatcher = Arc::new(MockDispatcher::offline());

        {
            let queue = Arc::new(
                OfflineQueue::load(
                    OfflineQueueConfig::default(),
                    DeliveryRetryPolicy::default(),
                    kv.clone(),
                    dispatcher.clone(),
                    EventBus::new(16),
                )
                .await
                .unwrap(),
            );
            queue.enqueue(chat("persisted", MessagePriority::High)).await.unwrap();
        }

        // 重新加载：条目仍在
        let queue = OfflineQueue::load(
            OfflineQueueConfig::default(),
            DeliveryRetryPolicy::default(),
            kv,
            dispatcher,
            EventBus::new(16),
        )
        .await
        .unwrap();
        assert_eq!(queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_stats_breakdown() {
        let dispatcher = Arc::new(MockDispatcher::offline());
        let (queue, _dir) = queue_with(dispatcher, OfflineQueueConfig::default()).await;

        queue.enqueue(chat("a", MessagePriority::High)).await.unwrap();
        queue
            .enqueue(
                QueuedMessage::new(
                    MessagePayload::Notification {
                        notification_type: "alert".to_string(),
                        title: "t".to_string(),
                        body: "b".to_string(),
                    },
                    MessagePriority::Urgent,
                )
                .with_category("alerts"),
            )
            .await
            .unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.by_kind.get(&MessageKind::ChatMessage), Some(&1));
        assert_eq!(stats.by_kind.get(&MessageKind::Notification), Some(&1));
        assert_eq!(stats.by_priority.get(&MessagePriority::Urgent), Some(&1));
        assert_eq!(stats.by_category.get("alerts"), Some(&1));
    }

    #[tokio::test]
    async fn test_end_to_end_urgent_first_after_reconnect() {
        // 离线入队若干低优先级，再入队一条紧急聊天消息；
        // 上线后第一条派发的必须是紧急消息。
        let dispatcher = Arc::new(MockDispatcher::offline());
        let (queue, _dir) = queue_with(dispatcher.clone(), OfflineQueueConfig::default()).await;

        queue.enqueue(chat("low-1", MessagePriority::Low)).await.unwrap();
        queue.enqueue(chat("low-2", MessagePriority::Low)).await.unwrap();
        let urgent = queue.enqueue(chat("紧急工单", MessagePriority::Urgent)).await.unwrap();

        dispatcher.set_online(true);
        queue.drain().await.unwrap();

        let dispatched = dispatcher.dispatched_ids();
        assert_eq!(dispatched.first(), Some(&urgent));
        assert_eq!(queue.pending_count().await, 0);
    }
}
