//! 重连退避策略
//!
//! 作用于整个传输的重连节奏，与队列条目的投递重试策略相互独立、分开配置。
//! 指数退避加 ±25% 对称抖动，避免大量客户端在网络恢复时同时重连。

use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// 重连退避配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectBackoffConfig {
    /// 初始延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 退避倍数
    pub multiplier: f64,
    /// 抖动比例（0.25 = ±25%）
    pub jitter_ratio: f64,
    /// 同一模式下的最大重连尝试次数，超出后切换备选模式
    pub max_attempts: u32,
}

impl Default for ReconnectBackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_ratio: 0.25,
            max_attempts: 10,
        }
    }
}

/// 重连退避状态机
#[derive(Debug)]
pub struct ReconnectBackoff {
    config: ReconnectBackoffConfig,
    /// 当前尝试次数
    attempts: RwLock<u32>,
}

impl ReconnectBackoff {
    pub fn new(config: ReconnectBackoffConfig) -> Self {
        Self {
            config,
            attempts: RwLock::new(0),
        }
    }

    /// 计算当前尝试次数下的退避延迟
    ///
    /// delay = min(base * multiplier^attempts, max)，再施加 ±jitter_ratio
    /// 的对称抖动，下限不低于 base。
    pub fn calculate_delay(&self) -> Duration {
        let attempts = *self.attempts.read();
        self.delay_for_attempts(attempts)
    }

    /// 按指定尝试次数计算延迟（测试与预览用）
    pub fn delay_for_attempts(&self, attempts: u32) -> Duration {
        let raw = self.config.base_delay_ms as f64
            * self.config.multiplier.powf(attempts as f64);
        let capped = raw.min(self.config.max_delay_ms as f64);

        // ±jitter_ratio 对称抖动
        let jitter = capped * self.config.jitter_ratio * (rand::random::<f64>() * 2.0 - 1.0);
        let with_jitter = (capped + jitter).max(self.config.base_delay_ms as f64);

        Duration::from_millis(with_jitter as u64)
    }

    /// 未加抖动的理论延迟（毫秒），测试断言抖动范围用
    pub fn raw_delay_ms(&self, attempts: u32) -> u64 {
        let raw = self.config.base_delay_ms as f64
            * self.config.multiplier.powf(attempts as f64);
        raw.min(self.config.max_delay_ms as f64) as u64
    }

    /// 登记一次重连尝试，返回新的尝试次数
    pub fn register_attempt(&self) -> u32 {
        let mut attempts = self.attempts.write();
        *attempts += 1;
        *attempts
    }

    /// 当前尝试次数
    pub fn attempts(&self) -> u32 {
        *self.attempts.read()
    }

    /// 是否已耗尽本模式的尝试预算
    pub fn is_exhausted(&self) -> bool {
        *self.attempts.read() >= self.config.max_attempts
    }

    /// 重置（连接成功或切换模式时调用）
    pub fn reset(&self) {
        *self.attempts.write() = 0;
    }

    pub fn config(&self) -> &ReconnectBackoffConfig {
        &self.config
    }
}
