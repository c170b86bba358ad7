//! 同步引擎
//!
//! 职责：
//! - 全量同步：先排空出站队列（按优先级、分批），再拉取入站增量与通知增量
//! - 增量同步：只拉取入站增量（出站由队列持续排空）
//! - 冲突确定性解决；入站按 ID 去重；通知经频率控制后浮出
//!
//! 互斥：同一时刻至多一次同步（忙标志单飞）；同步中再次请求为空操作。
//! 失败语义：任一阶段失败中止本次调用并记入 `last_sync_error`，水位
//! 保持不变，下次重拉同一区间；周期定时器不受影响。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::events::{EventBus, SdkEvent};
use crate::notify::{FrequencyController, FrequencyDecision};
use crate::queue::{MessageDispatcher, OfflineQueue};
use crate::remote::{OutboundItem, RemoteApi};
use crate::storage::{keys, KvStore};
use crate::sync::conflict::{ConflictHandler, ConflictResolver, ConflictStrategy};
use crate::sync::dedup::DedupCache;
use crate::sync::watermark::WatermarkManager;
use crate::sync::{SyncMode, SyncOutcome, SyncStatus};

/// 同步服务配置
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncServiceConfig {
    /// 周期增量同步间隔（秒）
    pub interval_secs: u64,
    /// 全量同步的出站批量大小
    pub outbound_batch_size: usize,
    /// 冲突默认策略
    pub default_conflict_strategy: ConflictStrategy,
}

impl Default for SyncServiceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            outbound_batch_size: 10,
            default_conflict_strategy: ConflictStrategy::ServerWins,
        }
    }
}

/// 持久化在状态对象里的那部分同步状态
#[derive(Debug, Clone, Default)]
struct StoredSyncState {
    last_sync_at: Option<i64>,
    last_sync_error: Option<String>,
}

/// 状态对账服务
pub struct MessageSyncService {
    config: SyncServiceConfig,
    api: Arc<dyn RemoteApi>,
    queue: Arc<OfflineQueue>,
    dispatcher: Arc<dyn MessageDispatcher>,
    watermark: WatermarkManager,
    dedup: DedupCache,
    resolver: RwLock<ConflictResolver>,
    frequency: Arc<FrequencyController>,
    stored: RwLock<StoredSyncState>,
    /// 单飞忙标志
    in_progress: AtomicBool,
    kv: Arc<KvStore>,
    events: EventBus,
}

impl std::fmt::Debug for MessageSyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSyncService")
            .field("config", &self.config)
            .finish()
    }
}

impl MessageSyncService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncServiceConfig,
        api: Arc<dyn RemoteApi>,
        queue: Arc<OfflineQueue>,
        dispatcher: Arc<dyn MessageDispatcher>,
        frequency: Arc<FrequencyController>,
        kv: Arc<KvStore>,
        events: EventBus,
    ) -> Self {
        let resolver = ConflictResolver::new(config.default_conflict_strategy);
        Self {
            config,
            api,
            queue,
            dispatcher,
            watermark: WatermarkManager::new(kv.clone()),
            dedup: DedupCache::new(),
            resolver: RwLock::new(resolver),
            frequency,
            stored: RwLock::new(StoredSyncState::default()),
            in_progress: AtomicBool::new(false),
            kv,
            events,
        }
    }

    /// 注册冲突处理器（返回值非空时策略变为 manual）
    pub async fn set_conflict_handler(&self, handler: Box<dyn ConflictHandler>) {
        self.resolver.write().await.set_handler(handler);
    }

    /// 当前对账状态快照
    pub async fn status(&self) -> SyncStatus {
        let stored = self.stored.read().await.clone();
        SyncStatus {
            is_online: self.dispatcher.is_online().await,
            last_sync_at: stored.last_sync_at,
            pending_count: self.queue.pending_count().await,
            sync_in_progress: self.in_progress.load(Ordering::SeqCst),
            last_sync_error: stored.last_sync_error,
        }
    }

    /// 全量同步
    pub async fn perform_full_sync(&self) -> Result<SyncOutcome> {
        self.sync(SyncMode::Full).await
    }

    /// 增量同步
    pub async fn perform_incremental_sync(&self) -> Result<SyncOutcome> {
        self.sync(SyncMode::Incremental).await
    }

    async fn sync(&self, mode: SyncMode) -> Result<SyncOutcome> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            debug!("已有同步在进行，本次 {:?} 请求跳过", mode);
            return Ok(SyncOutcome::Skipped);
        }

        let result = self.sync_inner(mode).await;
        self.in_progress.store(false, Ordering::SeqCst);

        match &result {
            Ok(outcome) => {
                let mut stored = self.stored.write().await;
                stored.last_sync_at = Some(chrono::Utc::now().timestamp_millis());
                stored.last_sync_error = None;
                drop(stored);
                self.events.emit(SdkEvent::SyncCompleted {
                    outcome: outcome.clone(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
            }
            Err(e) => {
                error!("同步失败（水位不前进，下次重拉）: {}", e);
                let mut stored = self.stored.write().await;
                stored.last_sync_error = Some(e.to_string());
                drop(stored);
                self.events.emit(SdkEvent::SyncFailed {
                    error: e.to_string(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
            }
        }

        result
    }

    async fn sync_inner(&self, mode: SyncMode) -> Result<SyncOutcome> {
        let since = self.watermark.local().await?;
        info!("开始 {:?} 同步: since={}", mode, since);

        // 阶段 1: 出站（仅全量；增量由队列持续排空）
        let (pushed, conflicts) = match mode {
            SyncMode::Full => self.push_outbound().await?,
            SyncMode::Incremental => (0, 0),
        };

        // 阶段 2: 入站增量
        let inbound = self.api.fetch_inbound(since).await?;
        let mut pulled = 0;
        for message in &inbound.messages {
            // 重复条目静默丢弃
            if self.dedup.is_duplicate(&message.id) {
                continue;
            }
            let key = format!("{}{}", keys::INBOX_PREFIX, message.id);
            self.kv.set(&key, message).await?;
            self.dedup.mark_seen(&message.id);
            pulled += 1;
        }

        // 阶段 3: 通知增量（仅全量），经频率控制后浮出
        let mut notifications = 0;
        if mode == SyncMode::Full {
            let batch = self.api.fetch_notifications(since).await?;
            for notification in batch.notifications {
                if self.dedup.is_duplicate(&notification.id) {
                    continue;
                }
                self.dedup.mark_seen(&notification.id);

                match self
                    .frequency
                    .should_allow(&notification.notification_type, notification.priority)
                {
                    FrequencyDecision::Allowed => {
                        self.frequency
                            .record(&notification.notification_type, notification.priority)
                            .await?;
                        notifications += 1;
                        self.events.emit(SdkEvent::NotificationSurfaced {
                            notification,
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        });
                    }
                    FrequencyDecision::Suppressed(reason) => {
                        debug!(
                            "通知被频率控制抑制: type={}, reason={:?}",
                            notification.notification_type, reason
                        );
                        self.events.emit(SdkEvent::NotificationSuppressed {
                            notification_type: notification.notification_type,
                            reason,
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        });
                    }
                }
            }
        }

        // 水位只在整体成功后前进
        self.watermark
            .advance(inbound.server_timestamp, inbound.server_timestamp)
            .await?;

        info!(
            "{:?} 同步完成: pushed={}, pulled={}, notifications={}, conflicts={}",
            mode, pushed, pulled, notifications, conflicts
        );
        Ok(SyncOutcome::Completed {
            mode,
            pushed,
            pulled,
            notifications,
            conflicts,
        })
    }

    /// 出站阶段：按优先级分批推送，直到队列排空或无进展
    async fn push_outbound(&self) -> Result<(usize, usize)> {
        let mut pushed = 0;
        let mut conflicts_resolved = 0;

        loop {
            // 快照已按优先级排序，取一批
            let pending = self.queue.snapshot().await;
            if pending.is_empty() {
                break;
            }
            let batch: Vec<OutboundItem> = pending
                .iter()
                .take(self.config.outbound_batch_size)
                .map(OutboundItem::from_message)
                .collect::<Result<_>>()?;

            let response = self.api.push_outbound_batch(&batch).await?;

            let synced_ids: Vec<String> =
                response.synced.iter().map(|s| s.temp_id.clone()).collect();
            let progressed = !synced_ids.is_empty();
            if progressed {
                self.queue.remove_delivered(&synced_ids).await?;
                pushed += synced_ids.len();
            }

            // 冲突处理：总是产出显式解决记录
            let mut superseded: Vec<String> = Vec::new();
            for conflict in response.conflicts {
                let item_id = conflict.item_id.clone();
                let resolution = self.resolver.read().await.resolve(conflict).await;
                conflicts_resolved += 1;

                match resolution.strategy {
                    ConflictStrategy::ClientWins => {
                        // 本地版本胜出：条目留在队列里再投一次
                        debug!("冲突 {} 客户端胜出，保留待投条目", item_id);
                    }
                    strategy => {
                        // 采用解决后的版本写入本地，原待投条目被取代
                        let key = format!("{}{}", keys::INBOX_PREFIX, resolution.resolved.id);
                        self.kv.set(&key, &resolution.resolved).await?;
                        self.dedup.mark_seen(&resolution.resolved.id);
                        superseded.push(item_id.clone());
                        debug!("冲突 {} 按 {:?} 解决", item_id, strategy);
                    }
                }

                self.events.emit(SdkEvent::ConflictResolved {
                    item_id,
                    strategy: resolution.strategy,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
            }
            if !superseded.is_empty() {
                self.queue.remove_delivered(&superseded).await?;
            }

            // 无进展（剩余条目全是 client-wins 冲突等）则收手，交给队列排空
            if !progressed && superseded.is_empty() {
                warn!("出站批量无进展，结束出站阶段（剩余 {} 条）", pending.len());
                break;
            }
        }

        Ok((pushed, conflicts_resolved))
    }

    /// 周期同步循环（由 SDK 门面挂起，关停时取消）
    ///
    /// 每个周期做一次增量同步；失败只记录，不中断定时器。
    pub async fn run_sync_loop(self: Arc<Self>, cancel: CancellationToken) {
        let interval = std::time::Duration::from_secs(self.config.interval_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // 首个 tick 立即完成，跳过

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.dispatcher.is_online().await {
                        debug!("离线，跳过本轮周期同步");
                        continue;
                    }
                    // 失败已记录在状态里，定时器继续
                    let _ = self.perform_incremental_sync().await;
                }
                _ = cancel.cancelled() => {
                    debug!("周期同步循环退出");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::notify::FrequencyConfig;
    use crate::queue::test_helpers::MockDispatcher;
    use crate::queue::{
        DeliveryRetryPolicy, MessagePayload, MessagePriority, OfflineQueueConfig, QueuedMessage,
    };
    use crate::remote::{
        InboundBatch, NotificationBatch, OutboundBatchResponse, RecordVersion, RemoteConflict,
        RemoteMessage, RemoteNotification, SyncedItem,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// 测试用远端：可脚本化入站/冲突/错误
    #[derive(Debug, Default)]
    struct MockRemoteApi {
        inbound: Mutex<Vec<RemoteMessage>>,
        notifications: Mutex<Vec<RemoteNotification>>,
        conflicts: Mutex<Vec<RemoteConflict>>,
        server_timestamp: Mutex<i64>,
        fail_inbound: Mutex<bool>,
        push_calls: Mutex<u32>,
    }

    impl MockRemoteApi {
        fn new() -> Arc<Self> {
            let api = Self::default();
            *api.server_timestamp.lock() = 1_000;
            Arc::new(api)
        }
    }

    #[async_trait]
    impl RemoteApi for MockRemoteApi {
        async fn push_outbound_batch(
            &self,
            items: &[OutboundItem],
        ) -> crate::error::Result<OutboundBatchResponse> {
            *self.push_calls.lock() += 1;
            let conflicts: Vec<RemoteConflict> = self.conflicts.lock().drain(..).collect();
            let conflicted: Vec<String> = conflicts.iter().map(|c| c.item_id.clone()).collect();
            Ok(OutboundBatchResponse {
                synced: items
                    .iter()
                    .filter(|i| !conflicted.contains(&i.temp_id))
                    .map(|i| SyncedItem {
                        temp_id: i.temp_id.clone(),
                    })
                    .collect(),
                conflicts,
            })
        }

        async fn fetch_inbound(&self, _since_ms: i64) -> crate::error::Result<InboundBatch> {
            if *self.fail_inbound.lock() {
                return Err(crate::error::OpslinkError::Timeout("模拟超时".to_string()));
            }
            Ok(InboundBatch {
                messages: self.inbound.lock().clone(),
                server_timestamp: *self.server_timestamp.lock(),
            })
        }

        async fn fetch_notifications(
            &self,
            _since_ms: i64,
        ) -> crate::error::Result<NotificationBatch> {
            Ok(NotificationBatch {
                notifications: self.notifications.lock().clone(),
            })
        }
    }

    struct Fixture {
        service: Arc<MessageSyncService>,
        queue: Arc<OfflineQueue>,
        api: Arc<MockRemoteApi>,
        kv: Arc<KvStore>,
        events: EventBus,
        _dir: TempDir,
    }

    async fn fixture(config: SyncServiceConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::new(dir.path()).await.unwrap());
        let events = EventBus::new(128);
        let dispatcher = Arc::new(MockDispatcher::offline());
        let queue = Arc::new(
            OfflineQueue::load(
                OfflineQueueConfig::default(),
                DeliveryRetryPolicy::default(),
                kv.clone(),
                dispatcher.clone(),
                events.clone(),
            )
            .await
            .unwrap(),
        );
        let frequency = Arc::new(
            FrequencyController::load(FrequencyConfig::default(), kv.clone())
                .await
                .unwrap(),
        );
        let api = MockRemoteApi::new();
        let service = Arc::new(MessageSyncService::new(
            config,
            api.clone(),
            queue.clone(),
            dispatcher,
            frequency,
            kv.clone(),
            events.clone(),
        ));
        Fixture {
            service,
            queue,
            api,
            kv,
            events,
            _dir: dir,
        }
    }

    fn remote_message(id: &str) -> RemoteMessage {
        RemoteMessage {
            id: id.to_string(),
            message_type: None,
            content: serde_json::json!({"text": "入站"}),
            metadata: serde_json::Value::Null,
            attachments: vec![],
            created_at: 500,
        }
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
    async fn test_incremental_sync_pulls_and_advances_watermark() {
        let f = fixture(SyncServiceConfig::default()).await;
        f.api.inbound.lock().push(remote_message("m1"));

        let outcome = f.service.perform_incremental_sync().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Completed {
                mode: SyncMode::Incremental,
                pushed: 0,
                pulled: 1,
                notifications: 0,
                conflicts: 0,
            }
        );
        assert_eq!(f.service.watermark.local().await.unwrap(), 1_000);

        // 入站条目已写入本地
        let stored: Option<RemoteMessage> = f.kv.get("inbox:m1").await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_incremental_sync_idempotent() {
        let f = fixture(SyncServiceConfig::default()).await;
        f.api.inbound.lock().push(remote_message("m1"));

        f.service.perform_incremental_sync().await.unwrap();
        let watermark_after_first = f.service.watermark.local().await.unwrap();
        let pending_after_first = f.service.status().await.pending_count;

        // 无新数据再跑一次：重复条目被去重，水位与待投数都不变
        let outcome = f.service.perform_incremental_sync().await.unwrap();
        match outcome {
            SyncOutcome::Completed { pulled, .. } => assert_eq!(pulled, 0),
            other => panic!("期望 Completed，得到 {:?}", other),
        }
        assert_eq!(f.service.watermark.local().await.unwrap(), watermark_after_first);
        assert_eq!(f.service.status().await.pending_count, pending_after_first);
    }

    #[tokio::test]
    async fn test_full_sync_drains_outbound_first() {
        let f = fixture(SyncServiceConfig::default()).await;
        f.queue.enqueue(chat("a", MessagePriority::Low)).await.unwrap();
        f.queue.enqueue(chat("b", MessagePriority::Urgent)).await.unwrap();

        let outcome = f.service.perform_full_sync().await.unwrap();
        match outcome {
            SyncOutcome::Completed { pushed, .. } => assert_eq!(pushed, 2),
            other => panic!("期望 Completed，得到 {:?}", other),
        }
        assert_eq!(f.queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_conflict_server_wins_supersedes_entry() {
        let f = fixture(SyncServiceConfig::default()).await;
        let msg = chat("本地版本", MessagePriority::High);
        let id = msg.id.clone();
        f.queue.enqueue(msg).await.unwrap();

        f.api.conflicts.lock().push(RemoteConflict {
            item_id: id.clone(),
            client_version: RecordVersion {
                id: id.clone(),
                content: serde_json::json!({"text": "本地版本"}),
                metadata: serde_json::Value::Null,
                attachments: vec![],
                updated_at: 1,
            },
            server_version: RecordVersion {
                id: id.clone(),
                content: serde_json::json!({"text": "远端版本"}),
                metadata: serde_json::json!({"rev": 9}),
                attachments: vec![],
                updated_at: 2,
            },
        });

        let mut receiver = f.events.subscribe();
        let outcome = f.service.perform_full_sync().await.unwrap();
        match outcome {
            SyncOutcome::Completed { conflicts, .. } => assert_eq!(conflicts, 1),
            other => panic!("期望 Completed，得到 {:?}", other),
        }

        // 原待投条目被取代，远端版本写入本地
        assert_eq!(f.queue.pending_count().await, 0);
        let stored: Option<RecordVersion> = f.kv.get(format!("inbox:{}", id)).await.unwrap();
        assert_eq!(stored.unwrap().content, serde_json::json!({"text": "远端版本"}));

        // 产生了显式的冲突解决事件
        let mut saw_resolution = false;
        while let Ok(event) = receiver.try_recv() {
            if let SdkEvent::ConflictResolved { strategy, .. } = event {
                assert_eq!(strategy, ConflictStrategy::ServerWins);
                saw_resolution = true;
            }
        }
        assert!(saw_resolution);
    }

    #[tokio::test]
    async fn test_conflict_client_wins_keeps_entry_for_redelivery() {
        let config = SyncServiceConfig {
            default_conflict_strategy: ConflictStrategy::ClientWins,
            ..Default::default()
        };
        let f = fixture(config).await;
        let msg = chat("本地版本", MessagePriority::High);
        let id = msg.id.clone();
        f.queue.enqueue(msg).await.unwrap();

        f.api.conflicts.lock().push(RemoteConflict {
            item_id: id.clone(),
            client_version: RecordVersion {
                id: id.clone(),
                content: serde_json::json!({"text": "本地版本"}),
                metadata: serde_json::Value::Null,
                attachments: vec![],
                updated_at: 1,
            },
            server_version: RecordVersion {
                id: id.clone(),
                content: serde_json::json!({"text": "远端版本"}),
                metadata: serde_json::Value::Null,
                attachments: vec![],
                updated_at: 2,
            },
        });

        let outcome = f.service.perform_full_sync().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed { .. }));

        // 条目留在队列里等待下次投递，且出站阶段正常终止（无死循环）
        assert_eq!(f.queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_watermark_and_records_error() {
        let f = fixture(SyncServiceConfig::default()).await;
        f.api.inbound.lock().push(remote_message("m1"));
        f.service.perform_incremental_sync().await.unwrap();
        assert_eq!(f.service.watermark.local().await.unwrap(), 1_000);

        *f.api.fail_inbound.lock() = true;
        let result = f.service.perform_incremental_sync().await;
        assert!(result.is_err());

        let status = f.service.status().await;
        assert!(status.last_sync_error.is_some());
        assert!(!status.sync_in_progress);
        // 水位不前进
        assert_eq!(f.service.watermark.local().await.unwrap(), 1_000);
    }

    #[tokio::test]
    async fn test_single_flight_skips_overlapping_sync() {
        let f = fixture(SyncServiceConfig::default()).await;

        f.service.in_progress.store(true, Ordering::SeqCst);
        let outcome = f.service.perform_incremental_sync().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped);
        f.service.in_progress.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_notifications_pass_frequency_controller() {
        let f = fixture(SyncServiceConfig::default()).await;
        // 两条同类型高优先级通知：第二条落在 1 分钟节流窗口内
        let now = chrono::Utc::now().timestamp_millis();
        for i in 0..2 {
            f.api.notifications.lock().push(RemoteNotification {
                id: format!("n{}", i),
                notification_type: "booking_update".to_string(),
                priority: MessagePriority::High,
                title: "预订变更".to_string(),
                body: format!("第 {} 条", i),
                created_at: now,
            });
        }

        let outcome = f.service.perform_full_sync().await.unwrap();
        match outcome {
            SyncOutcome::Completed { notifications, .. } => assert_eq!(notifications, 1),
            other => panic!("期望 Completed，得到 {:?}", other),
        }

        let stats = f.service.frequency.stats();
        assert_eq!(stats.suppressed_total, 1);
    }
}
