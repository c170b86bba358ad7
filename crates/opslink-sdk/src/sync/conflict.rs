//! 冲突解决
//!
//! 对账过程中远端标记的冲突在此确定性地解决，绝不静默丢弃：
//! - `ServerWins`（默认）：采用服务端版本
//! - `ClientWins`：采用本地版本，并把本地版本重新入队再投一次
//! - `Merge`：按既定规则合并（远端元数据胜出、本地内容胜出、附件列表拼接）
//! - `Manual`：注册的冲突处理器返回了值，采用该值

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::remote::{RecordVersion, RemoteConflict};

/// 冲突解决策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    ServerWins,
    ClientWins,
    Merge,
    Manual,
}

/// 冲突解决记录（瞬态，不在解决步骤之外持久化）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ConflictStrategy,
    pub client_version: RecordVersion,
    pub server_version: RecordVersion,
    /// 解决后采用的版本
    pub resolved: RecordVersion,
}

/// 冲突处理器（上层注册）
///
/// 返回 `Some(version)` 时策略变为 `Manual`，采用返回的版本。
#[async_trait]
pub trait ConflictHandler: Send + Sync {
    async fn resolve(&self, conflict: &RemoteConflict) -> Option<RecordVersion>;
}

/// 冲突解决器
pub struct ConflictResolver {
    /// 未注册处理器（或处理器不表态）时采用的策略
    default_strategy: ConflictStrategy,
    handler: Option<Box<dyn ConflictHandler>>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("default_strategy", &self.default_strategy)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl ConflictResolver {
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self {
            default_strategy,
            handler: None,
        }
    }

    /// 注册冲突处理器
    pub fn set_handler(&mut self, handler: Box<dyn ConflictHandler>) {
        self.handler = Some(handler);
    }

    /// 解决一个冲突，总是产出显式的解决记录
    pub async fn resolve(&self, conflict: RemoteConflict) -> ConflictResolution {
        // 1. 注册的处理器优先
        if let Some(handler) = &self.handler {
            if let Some(resolved) = handler.resolve(&conflict).await {
                debug!("冲突 {} 由注册处理器解决（manual）", conflict.item_id);
                return ConflictResolution {
                    strategy: ConflictStrategy::Manual,
                    client_version: conflict.client_version,
                    server_version: conflict.server_version,
                    resolved,
                };
            }
        }

        // 2. 默认策略
        let strategy = self.default_strategy;
        let resolved = match strategy {
            ConflictStrategy::ServerWins => conflict.server_version.clone(),
            ConflictStrategy::ClientWins => conflict.client_version.clone(),
            ConflictStrategy::Merge => {
                merge_versions(&conflict.client_version, &conflict.server_version)
            }
            // Manual 只能由处理器产生；无处理器时退回服务端版本
            ConflictStrategy::Manual => conflict.server_version.clone(),
        };

        debug!("冲突 {} 按 {:?} 解决", conflict.item_id, strategy);
        ConflictResolution {
            strategy,
            client_version: conflict.client_version,
            server_version: conflict.server_version,
            resolved,
        }
    }
}

/// 合并规则：远端元数据胜出、本地内容胜出、附件列表拼接
pub fn merge_versions(client: &RecordVersion, server: &RecordVersion) -> RecordVersion {
    let mut attachments = server.attachments.clone();
    for attachment in &client.attachments {
        if !attachments.contains(attachment) {
            attachments.push(attachment.clone());
        }
    }

    RecordVersion {
        id: client.id.clone(),
        content: client.content.clone(),
        metadata: server.metadata.clone(),
        attachments,
        updated_at: client.updated_at.max(server.updated_at),
    }
}
