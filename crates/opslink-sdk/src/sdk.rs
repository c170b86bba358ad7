//! SDK 门面 - 组件装配与生命周期
//!
//! 所有长生命周期组件（存储、事件总线、频率控制器、连接管理器、离线
//! 队列、同步服务）在进程启动时构造一次，按引用注入给使用方；没有
//! 隐藏的全局可变状态。后台循环（健康检查、过期清扫、周期同步）统一
//! 挂在取消令牌上，`shutdown()` 时一并停止。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{
    ConnectionConfig, ConnectionHealth, ConnectionManager, DefaultTransportFactory, DuplexConfig,
    PollingConfig, ReconnectBackoffConfig, TransportFactory,
};
use crate::error::{OpslinkError, Result};
use crate::events::{EventBus, SdkEvent};
use crate::notify::{FrequencyConfig, FrequencyController};
use crate::queue::{
    DeliveryRetryPolicy, MessageDispatcher, MessageFilter, MessagePayload, MessagePriority,
    OfflineQueue, OfflineQueueConfig, QueueStats, QueuedMessage,
};
use crate::remote::{ApiClient, HttpConfig, RemoteApi, TokenProvider};
use crate::storage::KvStore;
use crate::sync::{ConflictHandler, MessageSyncService, SyncOutcome, SyncServiceConfig, SyncStatus};
use crate::version::SDK_VERSION;

/// SDK 配置
#[derive(Debug, Clone)]
pub struct OpslinkConfig {
    /// 本地数据目录（KV 存储所在）
    pub data_dir: PathBuf,
    pub http: HttpConfig,
    pub duplex: DuplexConfig,
    pub polling: PollingConfig,
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectBackoffConfig,
    pub queue: OfflineQueueConfig,
    pub delivery_retry: DeliveryRetryPolicy,
    pub sync: SyncServiceConfig,
    pub frequency: FrequencyConfig,
    /// 事件总线容量
    pub event_capacity: usize,
}

impl OpslinkConfig {
    pub fn builder() -> OpslinkConfigBuilder {
        OpslinkConfigBuilder::default()
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct OpslinkConfigBuilder {
    data_dir: Option<PathBuf>,
    api_base_url: Option<String>,
    duplex_url: Option<String>,
    queue_capacity: Option<usize>,
    sync_interval_secs: Option<u64>,
    hourly_cap: Option<u32>,
}

impl OpslinkConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// REST 端点基础 URL
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    /// 双工通道 WebSocket URL
    pub fn duplex_url(mut self, url: impl Into<String>) -> Self {
        self.duplex_url = Some(url.into());
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn sync_interval_secs(mut self, secs: u64) -> Self {
        self.sync_interval_secs = Some(secs);
        self
    }

    pub fn notification_hourly_cap(mut self, cap: u32) -> Self {
        self.hourly_cap = Some(cap);
        self
    }

    pub fn build(self) -> Result<OpslinkConfig> {
        let data_dir = self
            .data_dir
            .ok_or_else(|| OpslinkError::Config("data_dir 未设置".to_string()))?;

        let mut http = HttpConfig::default();
        if let Some(url) = self.api_base_url {
            http.base_url = url;
        }
        let mut duplex = DuplexConfig::default();
        if let Some(url) = self.duplex_url {
            duplex.url = url;
        }
        let mut queue = OfflineQueueConfig::default();
        if let Some(capacity) = self.queue_capacity {
            queue.capacity = capacity;
        }
        let mut sync = SyncServiceConfig::default();
        if let Some(secs) = self.sync_interval_secs {
            sync.interval_secs = secs;
        }
        let mut frequency = FrequencyConfig::default();
        if let Some(cap) = self.hourly_cap {
            frequency.hourly_cap = cap;
        }

        Ok(OpslinkConfig {
            data_dir,
            http,
            duplex,
            polling: PollingConfig::default(),
            connection: ConnectionConfig::default(),
            reconnect: ReconnectBackoffConfig::default(),
            queue,
            delivery_retry: DeliveryRetryPolicy::default(),
            sync,
            frequency,
            event_capacity: 256,
        })
    }
}

/// Opslink SDK
///
/// 控制台与后端之间的弹性投递层：连接管理、离线队列、状态对账、
/// 通知频率控制。
pub struct OpslinkSdk {
    config: OpslinkConfig,
    kv: Arc<KvStore>,
    events: EventBus,
    frequency: Arc<FrequencyController>,
    connection: Arc<ConnectionManager>,
    queue: Arc<OfflineQueue>,
    sync: Arc<MessageSyncService>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl std::fmt::Debug for OpslinkSdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpslinkSdk")
            .field("version", &SDK_VERSION)
            .field("data_dir", &self.config.data_dir)
            .finish()
    }
}

impl OpslinkSdk {
    /// 初始化 SDK：装配组件、加载持久化状态、建立连接、启动后台循环
    pub async fn initialize(
        config: OpslinkConfig,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Result<Arc<Self>> {
        let api = Arc::new(ApiClient::new(&config.http, token_provider.clone())?);
        let factory = Arc::new(DefaultTransportFactory::new(
            config.duplex.clone(),
            config.polling.clone(),
            api.clone(),
            token_provider,
        ));
        Self::initialize_with_factory(config, api, factory).await
    }

    /// 同上，注入自定义传输工厂（嵌入式环境与测试用）
    pub async fn initialize_with_factory(
        config: OpslinkConfig,
        api: Arc<ApiClient>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Arc<Self>> {
        info!("🚀 初始化 Opslink SDK v{}", SDK_VERSION);

        let kv = Arc::new(KvStore::new(&config.data_dir).await?);
        let events = EventBus::new(config.event_capacity);

        let frequency = Arc::new(
            FrequencyController::load(config.frequency.clone(), kv.clone()).await?,
        );

        let connection = ConnectionManager::new(
            config.connection.clone(),
            config.reconnect.clone(),
            factory,
            api.clone(),
            events.clone(),
        );

        let queue = Arc::new(
            OfflineQueue::load(
                config.queue.clone(),
                config.delivery_retry.clone(),
                kv.clone(),
                connection.clone() as Arc<dyn MessageDispatcher>,
                events.clone(),
            )
            .await?,
        );

        let sync = Arc::new(MessageSyncService::new(
            config.sync.clone(),
            api as Arc<dyn RemoteApi>,
            queue.clone(),
            connection.clone() as Arc<dyn MessageDispatcher>,
            frequency.clone(),
            kv.clone(),
            events.clone(),
        ));

        let sdk = Arc::new(Self {
            config,
            kv,
            events,
            frequency,
            connection,
            queue,
            sync,
            cancel: CancellationToken::new(),
            running: AtomicBool::new(true),
        });

        sdk.start().await;
        info!("✅ Opslink SDK 初始化完成");
        Ok(sdk)
    }

    /// 启动后台循环并建立连接
    async fn start(&self) {
        self.connection.clone().start();
        self.connection.connect().await;

        // 排空工作循环
        tokio::spawn(
            self.queue
                .clone()
                .run_drain_worker(self.cancel.child_token()),
        );

        // 过期清扫循环
        tokio::spawn(
            self.queue
                .clone()
                .run_sweep_loop(self.cancel.child_token()),
        );

        // 周期增量同步循环
        tokio::spawn(
            self.sync
                .clone()
                .run_sync_loop(self.cancel.child_token()),
        );

        // 重连监听：连接恢复时排空队列并做一次全量同步
        {
            let queue = self.queue.clone();
            let sync = self.sync.clone();
            let mut receiver = self.events.subscribe();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = receiver.recv() => {
                            match event {
                                Ok(SdkEvent::ConnectionStatusChanged {
                                    state: crate::connection::ConnectionState::Connected,
                                    ..
                                }) => {
                                    debug!("连接恢复，触发排空与全量同步");
                                    let _ = queue.drain().await;
                                    let _ = sync.perform_full_sync().await;
                                }
                                Ok(_) => {}
                                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                    warn!("重连监听落后 {} 条事件", n);
                                }
                                Err(_) => break,
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }
    }

    // ============================================================
    // 出站操作
    // ============================================================

    /// 入队一条聊天消息，返回队列消息 ID
    pub async fn send_chat_message(
        &self,
        conversation_id: impl Into<String>,
        content: impl Into<String>,
        priority: MessagePriority,
    ) -> Result<String> {
        self.ensure_running()?;
        let message = QueuedMessage::new(
            MessagePayload::ChatMessage {
                conversation_id: conversation_id.into(),
                content: content.into(),
                attachments: vec![],
            },
            priority,
        );
        self.queue.enqueue(message).await
    }

    /// 入队一条通知
    pub async fn send_notification(
        &self,
        notification_type: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        priority: MessagePriority,
    ) -> Result<String> {
        self.ensure_running()?;
        let message = QueuedMessage::new(
            MessagePayload::Notification {
                notification_type: notification_type.into(),
                title: title.into(),
                body: body.into(),
            },
            priority,
        );
        self.queue.enqueue(message).await
    }

    /// 入队一个通用动作
    pub async fn enqueue_action(
        &self,
        method: impl Into<String>,
        endpoint: impl Into<String>,
        payload: serde_json::Value,
        priority: MessagePriority,
    ) -> Result<String> {
        self.ensure_running()?;
        let message = QueuedMessage::new(
            MessagePayload::GenericAction {
                method: method.into(),
                endpoint: endpoint.into(),
                payload,
            },
            priority,
        );
        self.queue.enqueue(message).await
    }

    /// 直接入队一条构造好的消息
    pub async fn enqueue(&self, message: QueuedMessage) -> Result<String> {
        self.ensure_running()?;
        self.queue.enqueue(message).await
    }

    /// 批量清除队列条目
    pub async fn clear_queue(&self, filter: Option<MessageFilter>) -> Result<usize> {
        self.queue.clear(filter).await
    }

    // ============================================================
    // 状态与订阅
    // ============================================================

    /// 订阅 SDK 事件（丢弃接收端即退订）
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SdkEvent> {
        self.events.subscribe()
    }

    /// 连接健康快照
    pub async fn connection_health(&self) -> ConnectionHealth {
        self.connection.health().await
    }

    /// 对账状态快照
    pub async fn sync_status(&self) -> SyncStatus {
        self.sync.status().await
    }

    /// 队列统计
    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// 手动触发一次全量同步
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        self.ensure_running()?;
        self.sync.perform_full_sync().await
    }

    /// 注册冲突处理器
    pub async fn set_conflict_handler(&self, handler: Box<dyn ConflictHandler>) {
        self.sync.set_conflict_handler(handler).await;
    }

    /// 频率控制器（免打扰时段管理等）
    pub fn frequency(&self) -> &Arc<FrequencyController> {
        &self.frequency
    }

    /// 连接管理器
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// 离线队列
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(OpslinkError::ShuttingDown("SDK 已关停".to_string()));
        }
        Ok(())
    }

    /// 关停 SDK：停止所有后台循环、拆除连接、刷盘
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在关停 Opslink SDK ...");

        self.cancel.cancel();
        self.connection.shutdown().await;
        self.kv.flush().await?;

        info!("✅ Opslink SDK 已关停");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_helpers::MockTransportFactory;
    use crate::remote::StaticTokenProvider;
    use tempfile::TempDir;

    async fn sdk_with_mock_transport() -> (Arc<OpslinkSdk>, Arc<MockTransportFactory>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = OpslinkConfig::builder()
            .data_dir(dir.path())
            .api_base_url("http://localhost:19999")
            .build()
            .unwrap();
        let api = Arc::new(
            ApiClient::new(&config.http, Arc::new(StaticTokenProvider::new("t"))).unwrap(),
        );
        let factory = MockTransportFactory::new();
        let sdk = OpslinkSdk::initialize_with_factory(config, api, factory.clone())
            .await
            .unwrap();
        (sdk, factory, dir)
    }

    #[tokio::test]
    async fn test_initialize_and_connect() {
        let (sdk, _factory, _dir) = sdk_with_mock_transport().await;

        let health = sdk.connection_health().await;
        assert_eq!(
            health.state,
            crate::connection::ConnectionState::Connected
        );
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_message_delivers_via_transport() {
        let (sdk, _factory, _dir) = sdk_with_mock_transport().await;
        let mut receiver = sdk.subscribe();

        let id = sdk
            .send_chat_message("conv_1", "现场确认完毕", MessagePriority::Urgent)
            .await
            .unwrap();

        // 在线入队会触发后台排空，等待投递完成事件
        let delivered = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                match receiver.recv().await {
                    Ok(SdkEvent::MessageDelivered { id: delivered_id, .. }) => {
                        break delivered_id
                    }
                    Ok(_) => continue,
                    Err(e) => panic!("事件流中断: {}", e),
                }
            }
        })
        .await
        .expect("等待投递事件超时");

        assert_eq!(delivered, id);
        assert_eq!(sdk.queue_stats().await.pending, 0);
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_rejected() {
        let (sdk, _factory, _dir) = sdk_with_mock_transport().await;
        sdk.shutdown().await.unwrap();

        let result = sdk
            .send_chat_message("conv", "late", MessagePriority::Low)
            .await;
        assert!(matches!(result, Err(OpslinkError::ShuttingDown(_))));
    }

    #[tokio::test]
    async fn test_config_builder_requires_data_dir() {
        let result = OpslinkConfig::builder().build();
        assert!(matches!(result, Err(OpslinkError::Config(_))));
    }
}
