//! HTTP 轮询回退传输
//!
//! 双工通道不可用时的替代：四类资源（指标、预订、活动、告警）各自按
//! 独立间隔轮询，互不阻塞 - 单个慢资源不会饿死其他资源。每类资源的
//! 失败单独上报，由连接管理器统一计入健康状态。
//!
//! 轮询模式下的出站发送走 REST 端点，调用方透过统一的 Transport
//! 接口无感知。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::health::ConnectionMode;
use crate::connection::{InboundEvent, Transport, TransportEvent};
use crate::error::Result;
use crate::queue::{MessagePayload, QueuedMessage};
use crate::remote::ApiClient;

/// 轮询的资源类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollResource {
    Metrics,
    Bookings,
    Activity,
    Alerts,
}

impl PollResource {
    /// 资源对应的 REST 路径
    pub fn path(&self) -> &'static str {
        match self {
            PollResource::Metrics => "/metrics",
            PollResource::Bookings => "/bookings",
            PollResource::Activity => "/activity",
            PollResource::Alerts => "/alerts",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PollResource::Metrics => "metrics",
            PollResource::Bookings => "bookings",
            PollResource::Activity => "activity",
            PollResource::Alerts => "alerts",
        }
    }

    /// 全部资源类别
    pub fn all() -> [PollResource; 4] {
        [
            PollResource::Metrics,
            PollResource::Bookings,
            PollResource::Activity,
            PollResource::Alerts,
        ]
    }
}

/// 轮询配置 - 每类资源独立间隔
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub metrics_interval_secs: u64,
    pub bookings_interval_secs: u64,
    pub activity_interval_secs: u64,
    pub alerts_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 5,
            bookings_interval_secs: 10,
            activity_interval_secs: 15,
            alerts_interval_secs: 20,
        }
    }
}

impl PollingConfig {
    /// 取资源的轮询间隔
    pub fn interval_for(&self, resource: PollResource) -> Duration {
        let secs = match resource {
            PollResource::Metrics => self.metrics_interval_secs,
            PollResource::Bookings => self.bookings_interval_secs,
            PollResource::Activity => self.activity_interval_secs,
            PollResource::Alerts => self.alerts_interval_secs,
        };
        Duration::from_secs(secs)
    }
}

/// 轮询传输
#[derive(Debug)]
pub struct PollingTransport {
    api: Arc<ApiClient>,
    transport_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl PollingTransport {
    /// 启动轮询：为每类资源挂起一个独立的轮询循环
    pub fn start(
        config: PollingConfig,
        api: Arc<ApiClient>,
        transport_tx: mpsc::Sender<TransportEvent>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        info!("📡 启动轮询回退（4 类资源独立间隔）");

        for resource in PollResource::all() {
            let api = api.clone();
            let transport_tx = transport_tx.clone();
            let cancel = cancel.clone();
            let interval = config.interval_for(resource);

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            Self::poll_once(&api, resource, &transport_tx).await;
                        }
                        _ = cancel.cancelled() => {
                            debug!("资源 {} 的轮询循环退出", resource.name());
                            break;
                        }
                    }
                }
            });
        }

        Arc::new(Self {
            api,
            transport_tx,
            cancel,
        })
    }

    /// 轮询一类资源，成功/失败分别上报
    async fn poll_once(
        api: &ApiClient,
        resource: PollResource,
        transport_tx: &mpsc::Sender<TransportEvent>,
    ) {
        let started = Instant::now();
        match api.get_json(resource.path()).await {
            Ok(payload) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                debug!("轮询 {} 成功 ({}ms)", resource.name(), latency_ms);
                let _ = transport_tx
                    .send(TransportEvent::Success {
                        mode: ConnectionMode::Polling,
                        latency_ms,
                    })
                    .await;
                let _ = transport_tx
                    .send(TransportEvent::Inbound(InboundEvent::ResourceUpdate {
                        resource,
                        payload,
                    }))
                    .await;
            }
            Err(e) => {
                warn!("轮询 {} 失败: {}", resource.name(), e);
                let _ = transport_tx
                    .send(TransportEvent::Failure {
                        mode: ConnectionMode::Polling,
                        error: e.to_string(),
                    })
                    .await;
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for PollingTransport {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Polling
    }

    /// 轮询模式下的出站发送走 REST 端点
    async fn send(&self, message: &QueuedMessage) -> Result<()> {
        let started = Instant::now();
        let result = match &message.payload {
            MessagePayload::Notification { .. } => {
                let payload = serde_json::to_value(&message.payload)?;
                self.api.send_notification(&payload).await
            }
            MessagePayload::ChatMessage { .. } => {
                let payload = serde_json::to_value(&message.payload)?;
                self.api.send_message(&payload).await
            }
            MessagePayload::GenericAction {
                method,
                endpoint,
                payload,
            } => self.api.dispatch(method, endpoint, payload).await.map(|_| ()),
        };

        match &result {
            Ok(()) => {
                let _ = self
                    .transport_tx
                    .send(TransportEvent::Success {
                        mode: ConnectionMode::Polling,
                        latency_ms: started.elapsed().as_millis() as u64,
                    })
                    .await;
            }
            Err(e) if e.is_transient() => {
                let _ = self
                    .transport_tx
                    .send(TransportEvent::Failure {
                        mode: ConnectionMode::Polling,
                        error: e.to_string(),
                    })
                    .await;
            }
            // 投递拒绝只计入条目的重试预算，不算传输失败
            Err(_) => {}
        }

        result
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_paths() {
        assert_eq!(PollResource::Metrics.path(), "/metrics");
        assert_eq!(PollResource::Alerts.path(), "/alerts");
        assert_eq!(PollResource::all().len(), 4);
    }

    #[test]
    fn test_distinct_intervals() {
        let config = PollingConfig::default();
        let mut intervals: Vec<Duration> = PollResource::all()
            .iter()
            .map(|r| config.interval_for(*r))
            .collect();
        intervals.dedup();
        // 四类资源的间隔各不相同
        assert_eq!(intervals.len(), 4);
    }
}
