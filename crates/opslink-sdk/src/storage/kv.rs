//! KV 存储模块 - 基于 sled 的本地键值存储
//!
//! 本模块提供：
//! - 进程重启后仍然存在的持久化键值存储
//! - 每个逻辑集合一个键，整文档 JSON 替换（单写者，无半更新状态）
//! - 前缀扫描（收件箱记录等按前缀组织的集合）

use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use sled::Db;

use crate::error::{OpslinkError, Result};

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    #[allow(dead_code)]
    base_path: PathBuf,
    db: Arc<Db>,
}

impl KvStore {
    /// 创建新的 KV 存储实例
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path).await
            .map_err(|e| OpslinkError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 打开 sled 数据库（上一实例可能刚释放文件锁，重试多次带退避）
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            OpslinkError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        Ok(Self {
            base_path,
            db: Arc::new(db),
        })
    }

    /// 设置键值对（整文档替换）
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| OpslinkError::Serialization(format!("序列化值失败: {}", e)))?;

        self.db.insert(key, value_bytes)
            .map_err(|e| OpslinkError::KvStore(format!("设置键值对失败: {}", e)))?;

        Ok(())
    }

    /// 获取键值对
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let result = self.db.get(key)
            .map_err(|e| OpslinkError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| OpslinkError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键值对
    pub async fn delete<K>(&self, key: K) -> Result<()>
    where
        K: AsRef<[u8]>,
    {
        self.db.remove(key)
            .map_err(|e| OpslinkError::KvStore(format!("删除键值对失败: {}", e)))?;

        Ok(())
    }

    /// 检查键是否存在
    pub async fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let result = self.db.contains_key(key)
            .map_err(|e| OpslinkError::KvStore(format!("检查键存在失败: {}", e)))?;

        Ok(result)
    }

    /// 获取指定前缀的所有键值对
    pub async fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let mut results = Vec::new();

        for result in self.db.scan_prefix(prefix) {
            let (key, value_bytes) = result
                .map_err(|e| OpslinkError::KvStore(format!("扫描前缀失败: {}", e)))?;

            let value = serde_json::from_slice(&value_bytes)
                .map_err(|e| OpslinkError::Serialization(format!("反序列化值失败: {}", e)))?;

            results.push((key.to_vec(), value));
        }

        Ok(results)
    }

    /// 刷盘（关停前调用，尽量减少掉电丢失窗口）
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await
            .map_err(|e| OpslinkError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    /// 获取统计信息
    pub async fn get_stats(&self) -> Result<KvStats> {
        let key_count = self.db.len() as u64;
        let storage_size = self.db.size_on_disk()
            .map_err(|e| OpslinkError::KvStore(format!("读取存储大小失败: {}", e)))?;

        Ok(KvStats {
            key_count,
            storage_size,
        })
    }
}

/// KV 存储统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvStats {
    pub key_count: u64,
    pub storage_size: u64,
}

/// 持久化集合的键常量
///
/// 每个逻辑集合一个键（或前缀），读取在启动时一次完成，写入整文档替换。
pub mod keys {
    /// 离线队列快照（QueuedMessage 数组）
    pub const QUEUE_SNAPSHOT: &str = "queue_snapshot";
    /// 最后同步水位（本地记录的 epoch 毫秒）
    pub const SYNC_WATERMARK: &str = "sync_watermark";
    /// 服务端报告的水位
    pub const SERVER_WATERMARK: &str = "server_watermark";
    /// 通知频率计数器
    pub const FREQUENCY_COUNTERS: &str = "frequency_counters";
    /// 免打扰时段列表
    pub const DND_SCHEDULES: &str = "dnd_schedules";
    /// 收件箱记录前缀（inbox:{message_id}）
    pub const INBOX_PREFIX: &str = "inbox:";
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use serde_json::json;

    #[tokio::test]
    async fn test_kv_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        // 设置和获取
        let test_data = json!({
            "name": "test",
            "value": 123
        });

        store.set("test_key", &test_data).await.unwrap();
        let retrieved: serde_json::Value = store.get("test_key").await.unwrap().unwrap();
        assert_eq!(retrieved, test_data);

        // 检查存在性
        assert!(store.exists("test_key").await.unwrap());
        assert!(!store.exists("non_existent_key").await.unwrap());

        // 删除
        store.delete("test_key").await.unwrap();
        let deleted: Option<serde_json::Value> = store.get("test_key").await.unwrap();
        assert!(deleted.is_none());
    }

    #[tokio::test]
    async fn test_kv_store_whole_document_replace() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        // 整文档替换：第二次写入完全覆盖第一次
        store.set(keys::QUEUE_SNAPSHOT, &json!([1, 2, 3])).await.unwrap();
        store.set(keys::QUEUE_SNAPSHOT, &json!([4])).await.unwrap();

        let snapshot: serde_json::Value = store.get(keys::QUEUE_SNAPSHOT).await.unwrap().unwrap();
        assert_eq!(snapshot, json!([4]));
    }

    #[tokio::test]
    async fn test_kv_store_scan_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        for i in 1..=3 {
            let key = format!("{}{}", keys::INBOX_PREFIX, i);
            store.set(&key, &json!({"value": i})).await.unwrap();
        }
        store.set("other_key", &json!({"value": 99})).await.unwrap();

        let results: Vec<(Vec<u8>, serde_json::Value)> =
            store.scan_prefix(keys::INBOX_PREFIX.as_bytes()).await.unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_kv_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();

        {
            let store = KvStore::new(temp_dir.path()).await.unwrap();
            store.set(keys::SYNC_WATERMARK, &1_700_000_000_000i64).await.unwrap();
            store.flush().await.unwrap();
        }

        // 重新打开后数据仍在
        let store = KvStore::new(temp_dir.path()).await.unwrap();
        let watermark: Option<i64> = store.get(keys::SYNC_WATERMARK).await.unwrap();
        assert_eq!(watermark, Some(1_700_000_000_000));
    }
}
