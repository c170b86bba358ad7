//! 基础用法演示：初始化 SDK、订阅事件、离线入队、观察投递
//!
//! 运行：cargo run --example basic

use std::sync::Arc;

use opslink_sdk::{MessagePriority, OpslinkConfig, OpslinkSdk, SdkEvent, StaticTokenProvider};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("opslink_sdk=debug")
        .init();

    let data_dir = std::env::temp_dir().join("opslink-demo");
    let config = OpslinkConfig::builder()
        .data_dir(&data_dir)
        .api_base_url("http://localhost:8080")
        .duplex_url("ws://localhost:8080/channel")
        .build()?;

    let sdk = OpslinkSdk::initialize(config, Arc::new(StaticTokenProvider::new("demo-token"))).await?;

    // 订阅事件流
    let mut events = sdk.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                SdkEvent::ConnectionStatusChanged { mode, state, .. } => {
                    println!("连接状态: {} / {}", mode, state);
                }
                SdkEvent::MessageDelivered { id, .. } => {
                    println!("已投递: {}", id);
                }
                SdkEvent::MessageDropped { id, reason, .. } => {
                    println!("已移除: {} ({:?})", id, reason);
                }
                _ => println!("事件: {}", event.event_type()),
            }
        }
    });

    // 入队：后端不可达时会留在队列里，连接恢复后按优先级排空
    let low = sdk
        .send_chat_message("conv_demo", "低优先级消息", MessagePriority::Low)
        .await?;
    let urgent = sdk
        .send_chat_message("conv_demo", "紧急消息（先投递）", MessagePriority::Urgent)
        .await?;
    println!("已入队: low={}, urgent={}", low, urgent);

    let stats = sdk.queue_stats().await;
    println!("队列统计: pending={}", stats.pending);

    tokio::time::sleep(std::time::Duration::from_secs(10)).await;

    let health = sdk.connection_health().await;
    println!("连接健康: {}", health.summary());

    sdk.shutdown().await?;
    Ok(())
}
