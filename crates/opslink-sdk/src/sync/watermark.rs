//! 水位管理器
//!
//! 职责：
//! - 存储并更新入站流最近一次成功对账到的时间点
//! - 区分本地记录的水位与服务端报告的水位
//! - 只在整体成功后前进，失败时保持不变以便下次重拉同一区间

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::storage::{keys, KvStore};

/// 水位管理器
#[derive(Debug, Clone)]
pub struct WatermarkManager {
    storage: Arc<KvStore>,
    /// 内存缓存：(本地水位, 服务端报告水位)
    cache: Arc<RwLock<Option<(i64, i64)>>>,
}

impl WatermarkManager {
    pub fn new(storage: Arc<KvStore>) -> Self {
        Self {
            storage,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// 获取本地水位（UTC 毫秒时间戳；从未同步过返回 0）
    pub async fn local(&self) -> Result<i64> {
        if let Some((local, _)) = *self.cache.read().await {
            return Ok(local);
        }

        let local: i64 = self.storage.get(keys::SYNC_WATERMARK).await?.unwrap_or(0);
        let server: i64 = self.storage.get(keys::SERVER_WATERMARK).await?.unwrap_or(0);

        let mut cache = self.cache.write().await;
        *cache = Some((local, server));
        Ok(local)
    }

    /// 服务端报告的水位
    pub async fn server_reported(&self) -> Result<i64> {
        if let Some((_, server)) = *self.cache.read().await {
            return Ok(server);
        }
        self.local().await?;
        Ok(self.cache.read().await.map(|(_, s)| s).unwrap_or(0))
    }

    /// 前进水位（整体成功后调用，整文档替换写入）
    pub async fn advance(&self, local: i64, server_reported: i64) -> Result<()> {
        debug!("前进同步水位: local={}, server={}", local, server_reported);

        self.storage.set(keys::SYNC_WATERMARK, &local).await?;
        self.storage.set(keys::SERVER_WATERMARK, &server_reported).await?;

        let mut cache = self.cache.write().await;
        *cache = Some((local, server_reported));
        Ok(())
    }

    /// 清空缓存（测试或重置用）
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        *cache = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_watermark_starts_at_zero() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());
        let manager = WatermarkManager::new(kv);

        assert_eq!(manager.local().await.unwrap(), 0);
        assert_eq!(manager.server_reported().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_advance_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());

        {
            let manager = WatermarkManager::new(kv.clone());
            manager.advance(1_000, 1_200).await.unwrap();
            assert_eq!(manager.local().await.unwrap(), 1_000);
        }

        // 新实例从存储读回
        let manager = WatermarkManager::new(kv);
        assert_eq!(manager.local().await.unwrap(), 1_000);
        assert_eq!(manager.server_reported().await.unwrap(), 1_200);
    }
}
