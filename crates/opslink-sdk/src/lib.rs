//! Opslink SDK - 操作台弹性投递层
//!
//! 让操作员控制台在不可靠网络下与后端保持同步，包括：
//! - 🔗 双模连接管理：双工通道（WebSocket）+ HTTP 轮询回退，自动切换
//! - 📦 持久化离线队列：优先级 + FIFO、容量驱逐、退避重试
//! - 🔄 状态对账：水位增量同步、去重、确定性冲突解决
//! - 🔕 通知频率控制：滚动上限、按类型节流、免打扰时段
//! - ⚙️ 事件系统：统一的状态广播与订阅机制
//! - 🧵 并发安全：异步优先设计，组件各自单飞，无全局锁
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use opslink_sdk::{OpslinkConfig, OpslinkSdk, MessagePriority, StaticTokenProvider};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 配置 SDK
//!     let config = OpslinkConfig::builder()
//!         .data_dir("/path/to/data")
//!         .api_base_url("https://api.example.com")
//!         .duplex_url("wss://api.example.com/channel")
//!         .build()?;
//!
//!     // 初始化（认证由外部提供 Bearer Token）
//!     let sdk = OpslinkSdk::initialize(config, Arc::new(StaticTokenProvider::new("token"))).await?;
//!
//!     // 订阅事件
//!     let mut events = sdk.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("事件: {}", event.event_type());
//!         }
//!     });
//!
//!     // 离线也能发：断线期间入队，恢复后按优先级排空
//!     let id = sdk
//!         .send_chat_message("conv_42", "现场已处理", MessagePriority::High)
//!         .await?;
//!     println!("已入队: {}", id);
//!
//!     // 关停
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod connection;
pub mod error;
pub mod events;
pub mod notify;
pub mod queue;
pub mod remote;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod version;

// 重新导出核心类型，方便使用
pub use connection::{
    ConnectionConfig, ConnectionHealth, ConnectionManager, ConnectionMode, ConnectionState,
    DuplexConfig, InboundEvent, PollResource, PollingConfig, ReconnectBackoffConfig, Transport,
    TransportFactory,
};
pub use error::{OpslinkError, Result};
pub use events::{EventBus, EventStats, SdkEvent};
pub use notify::{
    DndSchedule, FrequencyConfig, FrequencyController, FrequencyDecision, FrequencyStats,
    SuppressReason,
};
pub use queue::{
    DeliveryFailureReason, DeliveryRetryPolicy, DropReason, MessageDispatcher, MessageFilter,
    MessageKind, MessagePayload, MessagePriority, OfflineQueue, OfflineQueueConfig, QueueStats,
    QueuedMessage,
};
pub use remote::{
    ApiClient, HttpConfig, RemoteMessage, RemoteNotification, StaticTokenProvider, TokenProvider,
};
pub use sdk::{OpslinkConfig, OpslinkConfigBuilder, OpslinkSdk};
pub use sync::{
    ConflictHandler, ConflictResolution, ConflictStrategy, MessageSyncService, SyncMode,
    SyncOutcome, SyncServiceConfig, SyncStatus,
};
pub use version::SDK_VERSION;
