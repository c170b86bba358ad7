//! 本地持久化模块
//!
//! 控制台是单进程、单设备设计，所有持久化集合（队列快照、同步水位、
//! 通知频率计数器、免打扰时段）都以"整文档替换"的方式写入 KV 存储，
//! 避免半更新状态。

pub mod kv;

pub use kv::{keys, KvStore, KvStats};
