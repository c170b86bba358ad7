//! 连接管理模块
//!
//! 任一时刻只有一个活动传输（双工通道或轮询回退），向上层暴露统一的
//! 发送/轮询能力。模式切换、退避重连、定期健康检查都在这里收口：
//!
//! - 同一模式连续失败 3 次 → 切换备选传输
//! - 同一模式重连尝试耗尽（默认 10 次）→ 切换备选传输
//! - 每 30 秒健康检查：5 分钟无任何成功则强制发起重连
//!
//! 所有传输内部的成功/失败/推送通过事件通道汇入监督循环，统一转成
//! 健康状态变化与 SDK 事件。重连在单独的工作循环里执行（天然单飞），
//! 手动切换模式时递增代数使旧的重连循环失效。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{OpslinkError, Result};
use crate::events::{EventBus, SdkEvent};
use crate::queue::{MessageDispatcher, QueuedMessage};
use crate::remote::{ApiClient, TokenProvider};

pub mod backoff;
pub mod duplex;
pub mod health;
pub mod polling;

pub use backoff::{ReconnectBackoff, ReconnectBackoffConfig};
pub use duplex::{DuplexConfig, DuplexTransport};
pub use health::{ConnectionHealth, ConnectionMode, ConnectionState, HealthManager};
pub use polling::{PollResource, PollingConfig, PollingTransport};

/// 服务端推送的类型化入站事件（双工通道），以及轮询拉回的资源更新
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundEvent {
    /// 派单
    JobAssignment {
        id: String,
        payload: serde_json::Value,
    },
    /// 预订变更
    BookingUpdate {
        id: String,
        payload: serde_json::Value,
    },
    /// 状态变更
    StatusChange {
        id: String,
        payload: serde_json::Value,
    },
    /// 轮询拉回的资源更新
    ResourceUpdate {
        resource: PollResource,
        payload: serde_json::Value,
    },
}

impl InboundEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            InboundEvent::JobAssignment { .. } => "job_assignment",
            InboundEvent::BookingUpdate { .. } => "booking_update",
            InboundEvent::StatusChange { .. } => "status_change",
            InboundEvent::ResourceUpdate { .. } => "resource_update",
        }
    }
}

/// 传输内部事件，汇入连接管理器的监督循环
#[derive(Debug)]
pub enum TransportEvent {
    /// 一次成功的往返（心跳 pong / 轮询成功 / 发送成功）
    Success {
        mode: ConnectionMode,
        latency_ms: u64,
    },
    /// 一次失败
    Failure { mode: ConnectionMode, error: String },
    /// 入站推送/更新
    Inbound(InboundEvent),
    /// 连接断开
    Closed { mode: ConnectionMode, reason: String },
}

/// 传输抽象 - 队列与同步服务透过它发送，不感知具体模式
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    fn mode(&self) -> ConnectionMode;

    /// 发送一条出站消息
    async fn send(&self, message: &QueuedMessage) -> Result<()>;

    /// 拆除传输（停止内部任务）
    async fn shutdown(&self);
}

/// 传输工厂 - 按模式创建传输实例（测试注入替身的接缝）
#[async_trait]
pub trait TransportFactory: Send + Sync + std::fmt::Debug {
    async fn create(
        &self,
        mode: ConnectionMode,
        transport_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>>;
}

/// 默认传输工厂：双工通道 = WebSocket，回退 = HTTP 轮询
#[derive(Debug)]
pub struct DefaultTransportFactory {
    duplex_config: DuplexConfig,
    polling_config: PollingConfig,
    api: Arc<ApiClient>,
    token_provider: Arc<dyn TokenProvider>,
}

impl DefaultTransportFactory {
    pub fn new(
        duplex_config: DuplexConfig,
        polling_config: PollingConfig,
        api: Arc<ApiClient>,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            duplex_config,
            polling_config,
            api,
            token_provider,
        }
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(
        &self,
        mode: ConnectionMode,
        transport_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>> {
        match mode {
            ConnectionMode::Duplex => {
                let transport = DuplexTransport::connect(
                    self.duplex_config.clone(),
                    self.token_provider.clone(),
                    transport_tx,
                )
                .await?;
                Ok(transport as Arc<dyn Transport>)
            }
            ConnectionMode::Polling => {
                let transport = PollingTransport::start(
                    self.polling_config.clone(),
                    self.api.clone(),
                    transport_tx,
                );
                Ok(transport as Arc<dyn Transport>)
            }
            ConnectionMode::Disconnected => Err(OpslinkError::InvalidArgument(
                "不能为 disconnected 创建传输".to_string(),
            )),
        }
    }
}

/// 连接管理器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// 同一模式连续失败多少次后切换备选传输
    pub switch_failure_threshold: u32,
    /// 健康检查间隔（秒）
    pub health_check_interval_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            switch_failure_threshold: 3,
            health_check_interval_secs: 30,
        }
    }
}

/// 重连请求（force 表示无视当前上报状态，来自健康检查）
#[derive(Debug, Clone, Copy)]
struct ReconnectRequest {
    mode: ConnectionMode,
    force: bool,
}

/// 连接管理器
pub struct ConnectionManager {
    config: ConnectionConfig,
    health: HealthManager,
    backoff: ReconnectBackoff,
    factory: Arc<dyn TransportFactory>,
    api: Arc<ApiClient>,
    active: RwLock<Option<Arc<dyn Transport>>>,
    transport_tx: mpsc::Sender<TransportEvent>,
    /// 监督循环启动时取走
    transport_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    reconnect_tx: mpsc::Sender<ReconnectRequest>,
    /// 重连工作循环启动时取走
    reconnect_rx: Mutex<Option<mpsc::Receiver<ReconnectRequest>>>,
    /// 切换代数：手动切换递增，使旧的重连循环失效
    generation: AtomicU64,
    /// 转移锁：模式切换与重连尝试互斥，避免交错改写健康状态
    transition: Mutex<()>,
    events: EventBus,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        backoff_config: ReconnectBackoffConfig,
        factory: Arc<dyn TransportFactory>,
        api: Arc<ApiClient>,
        events: EventBus,
    ) -> Arc<Self> {
        let (transport_tx, transport_rx) = mpsc::channel(256);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(4);

        Arc::new(Self {
            config,
            health: HealthManager::new(),
            backoff: ReconnectBackoff::new(backoff_config),
            factory,
            api,
            active: RwLock::new(None),
            transport_tx,
            transport_rx: Mutex::new(Some(transport_rx)),
            reconnect_tx,
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            generation: AtomicU64::new(0),
            transition: Mutex::new(()),
            events,
            cancel: CancellationToken::new(),
        })
    }

    /// 启动监督循环、健康检查循环和重连工作循环
    pub fn start(self: Arc<Self>) {
        let manager = Arc::clone(&self);
        tokio::spawn(async move {
            manager.supervise_loop().await;
        });

        let manager = Arc::clone(&self);
        tokio::spawn(async move {
            manager.health_check_loop().await;
        });

        tokio::spawn(async move {
            self.reconnect_worker().await;
        });
    }

    /// 以双工通道为首选建立连接
    pub async fn connect(&self) {
        self.switch_to_mode(ConnectionMode::Duplex).await;
    }

    /// 健康快照（只读）
    pub async fn health(&self) -> ConnectionHealth {
        self.health.snapshot().await
    }

    /// 当前计算出的重连退避延迟
    pub fn calculate_backoff_delay(&self) -> std::time::Duration {
        self.backoff.calculate_delay()
    }

    /// 记录一次状态转移；仅实际变化时通知订阅者
    pub async fn update_status(
        &self,
        mode: ConnectionMode,
        state: ConnectionState,
        error: Option<String>,
    ) {
        let changed = self.health.update_status(mode, state, error).await;
        if changed {
            self.events.emit(SdkEvent::ConnectionStatusChanged {
                mode,
                state,
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
        }
    }

    /// 记录一次成功：清零失败计数并重置退避
    pub async fn record_success(&self, mode: ConnectionMode, latency_ms: u64) {
        let was_online = self.health.is_online().await;
        self.health.record_success(mode, latency_ms).await;
        self.backoff.reset();

        if !was_online {
            info!("✅ 连接恢复: mode={}, latency={}ms", mode, latency_ms);
            self.events.emit(SdkEvent::ConnectionStatusChanged {
                mode,
                state: ConnectionState::Connected,
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
        }
    }

    /// 记录一次失败
    ///
    /// 连续失败达到阈值（默认 3）切换备选传输，否则在当前模式内标记
    /// failed 并安排退避重连。
    pub async fn record_failure(&self, mode: ConnectionMode, error: &str) {
        let failures = self.health.record_failure(mode, error).await;
        warn!("连接失败 #{}: mode={}, error={}", failures, mode, error);

        if failures >= self.config.switch_failure_threshold {
            info!(
                "连续失败 {} 次，切换备选传输: {} → {}",
                failures,
                mode,
                mode.alternate()
            );
            self.switch_to_mode(mode.alternate()).await;
        } else {
            self.update_status(mode, ConnectionState::Failed, Some(error.to_string()))
                .await;
            self.attempt_reconnection(mode);
        }
    }

    /// 手动切换传输模式
    ///
    /// 拆除当前传输、作废挂起的重连、重置重连计数，然后初始化目标
    /// 传输。对调用方透明：切换前后的发送接口一致。
    pub async fn switch_to_mode(&self, mode: ConnectionMode) {
        let _guard = self.transition.lock().await;
        // 递增代数，使进行中的重连循环在下一次检查时退出
        self.generation.fetch_add(1, Ordering::SeqCst);

        self.teardown_active().await;
        self.backoff.reset();
        self.health.reset_reconnect_attempts().await;
        self.health.reset_consecutive_failures().await;

        if let Err(e) = self.try_establish(mode).await {
            warn!("初始化 {} 传输失败: {}", mode, e);
            self.update_status(mode, ConnectionState::Failed, Some(e.to_string()))
                .await;
            self.attempt_reconnection(mode);
        }
    }

    /// 安排一次重连（交给重连工作循环执行，天然单飞）
    pub fn attempt_reconnection(&self, mode: ConnectionMode) {
        self.request_reconnect(mode, false);
    }

    fn request_reconnect(&self, mode: ConnectionMode, force: bool) {
        if self
            .reconnect_tx
            .try_send(ReconnectRequest { mode, force })
            .is_err()
        {
            debug!("重连请求队列已满，忽略本次请求");
        }
    }

    /// 重连工作循环：逐个消费重连请求
    async fn reconnect_worker(self: Arc<Self>) {
        let mut rx = {
            let mut guard = self.reconnect_rx.lock().await;
            match guard.take() {
                Some(rx) => rx,
                None => {
                    error!("重连工作循环重复启动");
                    return;
                }
            }
        };

        loop {
            tokio::select! {
                maybe_req = rx.recv() => {
                    let Some(request) = maybe_req else { break };
                    self.run_reconnect(request).await;
                }
                _ = self.cancel.cancelled() => break,
            }
        }
        debug!("重连工作循环退出");
    }

    /// 执行一轮重连：退避等待 → 尝试建立 → 失败继续；尝试耗尽换备选模式
    async fn run_reconnect(&self, request: ReconnectRequest) {
        // 非强制请求到达时若已在线则视为过期
        if !request.force && self.health.is_online().await {
            return;
        }

        let my_generation = self.generation.load(Ordering::SeqCst);
        let mut mode = request.mode;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            // 退避参数与状态更新在转移锁内进行，手动切换后立即失效
            let delay = {
                let _guard = self.transition.lock().await;
                if self.generation.load(Ordering::SeqCst) != my_generation {
                    return;
                }

                if self.backoff.is_exhausted() {
                    let alternate = mode.alternate();
                    info!("模式 {} 的重连尝试已耗尽，切换到 {}", mode, alternate);
                    self.teardown_active().await;
                    self.backoff.reset();
                    self.health.reset_reconnect_attempts().await;
                    mode = alternate;
                }

                let delay = self.backoff.calculate_delay();
                self.backoff.register_attempt();
                let attempts = self.health.bump_reconnect_attempts().await;
                self.update_status(mode, ConnectionState::Reconnecting, None).await;
                debug!(
                    "第 {} 次重连 {}，退避 {}ms",
                    attempts,
                    mode,
                    delay.as_millis()
                );
                delay
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return,
            }

            let _guard = self.transition.lock().await;
            if self.generation.load(Ordering::SeqCst) != my_generation {
                return;
            }
            match self.try_establish(mode).await {
                Ok(()) => {
                    info!("重连成功: mode={}", mode);
                    return;
                }
                Err(e) => {
                    self.health.record_failure(mode, &e.to_string()).await;
                    debug!("重连失败: {}", e);
                }
            }
        }
    }

    /// 创建并挂上目标模式的传输
    async fn try_establish(&self, mode: ConnectionMode) -> Result<()> {
        self.update_status(mode, ConnectionState::Connecting, None).await;

        let transport = self.factory.create(mode, self.transport_tx.clone()).await?;
        {
            let mut active = self.active.write().await;
            *active = Some(transport);
        }
        self.update_status(mode, ConnectionState::Connected, None).await;
        Ok(())
    }

    /// 拆除当前活动传输
    async fn teardown_active(&self) {
        let transport = {
            let mut active = self.active.write().await;
            active.take()
        };
        if let Some(transport) = transport {
            debug!("拆除 {} 传输", transport.mode());
            transport.shutdown().await;
        }
    }

    /// 按需即时拉取一类资源（与当前模式无关，统一走 REST）
    pub async fn poll_now(&self, resource: PollResource) -> Result<serde_json::Value> {
        self.api.get_json(resource.path()).await
    }

    /// 监督循环：消费传输事件，折算成健康状态与 SDK 事件
    async fn supervise_loop(self: Arc<Self>) {
        let mut rx = {
            let mut guard = self.transport_rx.lock().await;
            match guard.take() {
                Some(rx) => rx,
                None => {
                    error!("监督循环重复启动");
                    return;
                }
            }
        };

        loop {
            tokio::select! {
                maybe_event = rx.recv() => {
                    let Some(event) = maybe_event else { break };
                    match event {
                        TransportEvent::Success { mode, latency_ms } => {
                            self.record_success(mode, latency_ms).await;
                        }
                        TransportEvent::Failure { mode, error } => {
                            self.record_failure(mode, &error).await;
                        }
                        TransportEvent::Inbound(event) => {
                            self.events.emit(SdkEvent::RemoteEvent {
                                event,
                                timestamp: chrono::Utc::now().timestamp_millis(),
                            });
                        }
                        TransportEvent::Closed { mode, reason } => {
                            self.record_failure(mode, &reason).await;
                        }
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
        debug!("监督循环退出");
    }

    /// 健康检查循环：长时间无成功则强制重连，无视当前上报的状态
    async fn health_check_loop(self: Arc<Self>) {
        let interval = std::time::Duration::from_secs(self.config.health_check_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // 第一个 tick 立即完成，跳过以免启动时误判
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.health.snapshot().await;
                    if snapshot.state == ConnectionState::Connecting {
                        continue;
                    }
                    let stale = match snapshot.last_success_at {
                        Some(at) => {
                            chrono::Utc::now().timestamp_millis() - at > health::HEALTH_FRESHNESS_MS
                        }
                        None => true,
                    };
                    if stale {
                        warn!(
                            "健康检查: {}ms 内无成功往返，强制重连（当前状态 {}）",
                            health::HEALTH_FRESHNESS_MS, snapshot.state
                        );
                        let mode = if snapshot.mode == ConnectionMode::Disconnected {
                            ConnectionMode::Duplex
                        } else {
                            snapshot.mode
                        };
                        self.request_reconnect(mode, true);
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    /// 关停：取消所有内部任务并拆除传输
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.teardown_active().await;
        self.update_status(
            ConnectionMode::Disconnected,
            ConnectionState::Disconnected,
            None,
        )
        .await;
    }
}

/// 队列的投递口：路由到当前活动传输
#[async_trait]
impl MessageDispatcher for ConnectionManager {
    async fn is_online(&self) -> bool {
        self.health.is_online().await
    }

    async fn dispatch(&self, message: &QueuedMessage) -> Result<()> {
        let transport = {
            let active = self.active.read().await;
            active.clone()
        };
        match transport {
            Some(transport) => transport.send(message).await,
            None => Err(OpslinkError::NotConnected),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_helpers::*;
    use super::*;
    use crate::queue::{MessagePayload, MessagePriority};
    use crate::remote::{HttpConfig, StaticTokenProvider};

    fn api() -> Arc<ApiClient> {
        Arc::new(
            ApiClient::new(
                &HttpConfig::default(),
                Arc::new(StaticTokenProvider::new("test")),
            )
            .unwrap(),
        )
    }

    fn fast_backoff() -> ReconnectBackoffConfig {
        ReconnectBackoffConfig {
            base_delay_ms: 5,
            max_delay_ms: 20,
            multiplier: 2.0,
            jitter_ratio: 0.25,
            max_attempts: 2,
        }
    }

    fn manager(factory: Arc<MockTransportFactory>) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            ConnectionConfig::default(),
            fast_backoff(),
            factory,
            api(),
            EventBus::new(64),
        )
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("等待条件超时");
    }

    #[tokio::test]
    async fn test_connect_prefers_duplex() {
        let factory = MockTransportFactory::new();
        let manager = manager(factory.clone());

        manager.connect().await;
        let health = manager.health().await;
        assert_eq!(health.mode, ConnectionMode::Duplex);
        assert_eq!(health.state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_three_failures_switch_to_alternate_mode() {
        let factory = MockTransportFactory::new();
        let manager = manager(factory.clone());
        manager.connect().await;

        // 连续三次失败触发切换到轮询
        manager.record_failure(ConnectionMode::Duplex, "超时").await;
        manager.record_failure(ConnectionMode::Duplex, "超时").await;
        let before = manager.health().await;
        assert_eq!(before.mode, ConnectionMode::Duplex);

        manager.record_failure(ConnectionMode::Duplex, "超时").await;
        let after = manager.health().await;
        assert_eq!(after.mode, ConnectionMode::Polling);
        assert_eq!(after.state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let factory = MockTransportFactory::new();
        let manager = manager(factory);
        manager.connect().await;

        manager.record_failure(ConnectionMode::Duplex, "超时").await;
        manager.record_failure(ConnectionMode::Duplex, "超时").await;
        manager.record_success(ConnectionMode::Duplex, 20).await;

        let health = manager.health().await;
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.is_healthy());

        // 清零后再失败两次也不触发切换
        manager.record_failure(ConnectionMode::Duplex, "超时").await;
        manager.record_failure(ConnectionMode::Duplex, "超时").await;
        assert_eq!(manager.health().await.mode, ConnectionMode::Duplex);
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_fails_over() {
        let factory = MockTransportFactory::new();
        factory.fail_mode(ConnectionMode::Duplex);
        let manager = manager(factory.clone());
        manager.clone().start();

        // 双工建立失败 → 重连循环 → 2 次尝试耗尽 → 换轮询成功
        manager.connect().await;
        wait_until(|| {
            let manager = manager.clone();
            async move {
                let health = manager.health().await;
                health.mode == ConnectionMode::Polling
                    && health.state == ConnectionState::Connected
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_status_event_only_on_change() {
        let factory = MockTransportFactory::new();
        let events = EventBus::new(64);
        let manager = ConnectionManager::new(
            ConnectionConfig::default(),
            fast_backoff(),
            factory,
            api(),
            events.clone(),
        );
        let mut receiver = events.subscribe();

        manager
            .update_status(ConnectionMode::Duplex, ConnectionState::Connecting, None)
            .await;
        manager
            .update_status(ConnectionMode::Duplex, ConnectionState::Connecting, None)
            .await;

        // 只有第一次转移产生事件
        let first = receiver.try_recv();
        assert!(first.is_ok());
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_active_transport() {
        let factory = MockTransportFactory::new();
        let manager = manager(factory);
        manager.connect().await;

        let message = QueuedMessage::new(
            MessagePayload::ChatMessage {
                conversation_id: "c".to_string(),
                content: "hi".to_string(),
                attachments: vec![],
            },
            MessagePriority::High,
        );
        assert!(manager.is_online().await);
        manager.dispatch(&message).await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_without_transport_is_not_connected() {
        let factory = MockTransportFactory::new();
        let manager = manager(factory);

        let message = QueuedMessage::new(
            MessagePayload::ChatMessage {
                conversation_id: "c".to_string(),
                content: "hi".to_string(),
                attachments: vec![],
            },
            MessagePriority::High,
        );
        let result = manager.dispatch(&message).await;
        assert!(matches!(result, Err(OpslinkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_manual_switch_supersedes_pending_reconnect() {
        let factory = MockTransportFactory::new();
        factory.fail_mode(ConnectionMode::Duplex);
        let manager = manager(factory.clone());
        manager.clone().start();

        // 双工建立失败，进入重连；手动切到轮询应立即生效
        manager.connect().await;
        manager.switch_to_mode(ConnectionMode::Polling).await;

        let health = manager.health().await;
        assert_eq!(health.mode, ConnectionMode::Polling);
        assert_eq!(health.state, ConnectionState::Connected);
        // 重连计数被切换重置
        assert_eq!(health.reconnect_attempts, 0);
    }
}
