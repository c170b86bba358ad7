//! 双工通道传输 - WebSocket 客户端
//!
//! 持久化双向连接，支持服务端主动推送：
//! - 类型化的入站事件（派单、预订变更、状态变更）
//! - 应用层心跳 ping/pong，顺带测量延迟
//! - 出站发送按关联 ID 等待 ack 回执
//!
//! 连接生命周期（断开、失败）通过传输事件通道上报给连接管理器，
//! 由管理器决定重连或切换轮询回退。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::health::ConnectionMode;
use crate::connection::{InboundEvent, Transport, TransportEvent};
use crate::error::{OpslinkError, Result};
use crate::queue::QueuedMessage;
use crate::remote::TokenProvider;

/// 双工通道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplexConfig {
    /// WebSocket 端点（wss://...）
    pub url: String,
    /// 握手超时（秒）
    pub connect_timeout_secs: u64,
    /// 心跳间隔（秒）
    pub heartbeat_interval_secs: u64,
    /// 出站 ack 等待超时（秒）
    pub ack_timeout_secs: u64,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/channel".to_string(),
            connect_timeout_secs: 15,
            heartbeat_interval_secs: 30,
            ack_timeout_secs: 10,
        }
    }
}

/// 双工通道线上帧
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    /// 心跳请求（客户端 → 服务端），携带发出时间用于测延迟
    Ping { sent_at: i64 },
    /// 心跳响应（服务端原样回传 sent_at）
    Pong { sent_at: i64 },
    /// 服务端推送的类型化事件
    Event {
        #[serde(flatten)]
        event: InboundEvent,
    },
    /// 出站发送（客户端 → 服务端）
    Send {
        correlation_id: String,
        kind: String,
        payload: serde_json::Value,
    },
    /// 发送回执（按关联 ID 对应）
    Ack {
        correlation_id: String,
        ok: bool,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        error: Option<String>,
    },
}

type AckResult = std::result::Result<(), (u16, String)>;

/// 双工通道传输
#[derive(Debug)]
pub struct DuplexTransport {
    config: DuplexConfig,
    outbound_tx: mpsc::Sender<Message>,
    /// 等待 ack 的出站请求（correlation_id → 回执通道）
    pending_acks: Arc<Mutex<HashMap<String, oneshot::Sender<AckResult>>>>,
    cancel: CancellationToken,
}

impl DuplexTransport {
    /// 建立连接并启动读取/写入/心跳任务
    pub async fn connect(
        config: DuplexConfig,
        token_provider: Arc<dyn TokenProvider>,
        transport_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<Self>> {
        info!("🔌 建立双工通道: {}", config.url);

        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| OpslinkError::Config(format!("无效的双工通道 URL: {}", e)))?;
        if let Some(token) = token_provider.bearer_token().await {
            let value = format!("Bearer {}", token)
                .parse()
                .map_err(|_| OpslinkError::Config("Bearer Token 含非法字符".to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let (ws_stream, _response) =
            tokio::time::timeout(connect_timeout, connect_async(request))
                .await
                .map_err(|_| OpslinkError::Timeout("双工通道握手超时".to_string()))??;

        info!("✅ 双工通道已建立");

        let (mut sink, mut stream) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(64);
        let pending_acks: Arc<Mutex<HashMap<String, oneshot::Sender<AckResult>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let transport = Arc::new(Self {
            config: config.clone(),
            outbound_tx: outbound_tx.clone(),
            pending_acks: pending_acks.clone(),
            cancel: cancel.clone(),
        });

        // 写入任务
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        maybe_msg = outbound_rx.recv() => {
                            let Some(msg) = maybe_msg else { break };
                            if let Err(e) = sink.send(msg).await {
                                warn!("双工通道写入失败: {}", e);
                                break;
                            }
                        }
                        _ = cancel.cancelled() => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            });
        }

        // 读取任务
        {
            let cancel = cancel.clone();
            let pending_acks = pending_acks.clone();
            let transport_tx = transport_tx.clone();
            let outbound_tx = outbound_tx.clone();
            tokio::spawn(async move {
                let close_reason = loop {
                    tokio::select! {
                        maybe_msg = stream.next() => {
                            match maybe_msg {
                                Some(Ok(Message::Text(text))) => {
                                    Self::handle_frame(&text, &pending_acks, &transport_tx, &outbound_tx)
                                        .await;
                                }
                                Some(Ok(Message::Close(_))) => break "服务端关闭连接".to_string(),
                                Some(Ok(_)) => {} // 忽略二进制/ws 层 ping 等
                                Some(Err(e)) => break format!("读取失败: {}", e),
                                None => break "连接流结束".to_string(),
                            }
                        }
                        _ = cancel.cancelled() => return,
                    }
                };

                warn!("🔌 双工通道断开: {}", close_reason);
                let _ = transport_tx
                    .send(TransportEvent::Closed {
                        mode: ConnectionMode::Duplex,
                        reason: close_reason,
                    })
                    .await;
            });
        }

        // 心跳任务
        {
            let cancel = cancel.clone();
            let outbound_tx = outbound_tx.clone();
            let interval = Duration::from_secs(config.heartbeat_interval_secs);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let frame = WireFrame::Ping {
                                sent_at: chrono::Utc::now().timestamp_millis(),
                            };
                            let text = match serde_json::to_string(&frame) {
                                Ok(t) => t,
                                Err(_) => continue,
                            };
                            if outbound_tx.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }

        Ok(transport)
    }

    /// 处理一个入站帧
    async fn handle_frame(
        text: &str,
        pending_acks: &Arc<Mutex<HashMap<String, oneshot::Sender<AckResult>>>>,
        transport_tx: &mpsc::Sender<TransportEvent>,
        outbound_tx: &mpsc::Sender<Message>,
    ) {
        let frame: WireFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("无法解析的双工通道帧: {}", e);
                return;
            }
        };

        match frame {
            WireFrame::Pong { sent_at } => {
                let latency = (chrono::Utc::now().timestamp_millis() - sent_at).max(0) as u64;
                debug!("💓 心跳往返 {}ms", latency);
                let _ = transport_tx
                    .send(TransportEvent::Success {
                        mode: ConnectionMode::Duplex,
                        latency_ms: latency,
                    })
                    .await;
            }
            WireFrame::Event { event } => {
                debug!("📨 服务端推送: {}", event.event_type());
                let _ = transport_tx.send(TransportEvent::Inbound(event)).await;
            }
            WireFrame::Ack {
                correlation_id,
                ok,
                status,
                error,
            } => {
                let sender = pending_acks.lock().remove(&correlation_id);
                if let Some(sender) = sender {
                    let result = if ok {
                        Ok(())
                    } else {
                        Err((
                            status.unwrap_or(500),
                            error.unwrap_or_else(|| "服务端拒绝".to_string()),
                        ))
                    };
                    let _ = sender.send(result);
                } else {
                    debug!("收到无主 ack: correlation_id={}", correlation_id);
                }
            }
            WireFrame::Ping { sent_at } => {
                // 服务端也可能主动 ping，原样回 pong
                if let Ok(text) = serde_json::to_string(&WireFrame::Pong { sent_at }) {
                    let _ = outbound_tx.send(Message::Text(text)).await;
                }
            }
            WireFrame::Send { .. } => {
                warn!("客户端不应收到 send 帧，忽略");
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for DuplexTransport {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Duplex
    }

    /// 发送一条出站消息并等待 ack
    async fn send(&self, message: &QueuedMessage) -> Result<()> {
        let correlation_id = Uuid::new_v4().to_string();
        let frame = WireFrame::Send {
            correlation_id: correlation_id.clone(),
            kind: message.kind.name().to_string(),
            payload: serde_json::to_value(&message.payload)?,
        };
        let text = serde_json::to_string(&frame)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks.lock().insert(correlation_id.clone(), ack_tx);

        if self.outbound_tx.send(Message::Text(text)).await.is_err() {
            self.pending_acks.lock().remove(&correlation_id);
            return Err(OpslinkError::NotConnected);
        }

        let ack_timeout = Duration::from_secs(self.config.ack_timeout_secs);
        match tokio::time::timeout(ack_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err((status, error)))) => Err(OpslinkError::from_http_status(status, error)),
            Ok(Err(_)) => Err(OpslinkError::Transport("ack 通道被关闭".to_string())),
            Err(_) => {
                self.pending_acks.lock().remove(&correlation_id);
                Err(OpslinkError::Timeout(format!(
                    "等待 ack 超时: correlation_id={}",
                    correlation_id
                )))
            }
        }
    }

    /// 拆除连接：取消所有任务并使等待中的 ack 失败
    async fn shutdown(&self) {
        self.cancel.cancel();
        let pending: Vec<_> = self.pending_acks.lock().drain().collect();
        for (_, sender) in pending {
            let _ = sender.send(Err((0, "传输已拆除".to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_frame_roundtrip() {
        let frame = WireFrame::Send {
            correlation_id: "abc".to_string(),
            kind: "chat_message".to_string(),
            payload: serde_json::json!({"content": "你好"}),
        };
        let text = serde_json::to_string(&frame).unwrap();
        let parsed: WireFrame = serde_json::from_str(&text).unwrap();
        assert!(matches!(parsed, WireFrame::Send { .. }));
    }

    #[test]
    fn test_event_frame_parses_typed_events() {
        let text = r#"{"type":"event","event":"job_assignment","id":"j1","payload":{"worker":"w9"}}"#;
        let frame: WireFrame = serde_json::from_str(text).unwrap();
        match frame {
            WireFrame::Event { event } => {
                assert_eq!(event.event_type(), "job_assignment");
            }
            other => panic!("期望 event 帧，得到 {:?}", other),
        }
    }

    #[test]
    fn test_ack_frame_defaults() {
        let text = r#"{"type":"ack","correlation_id":"x","ok":true}"#;
        let frame: WireFrame = serde_json::from_str(text).unwrap();
        match frame {
            WireFrame::Ack { ok, status, error, .. } => {
                assert!(ok);
                assert!(status.is_none());
                assert!(error.is_none());
            }
            other => panic!("期望 ack 帧，得到 {:?}", other),
        }
    }
}
