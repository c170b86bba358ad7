//! 通知频率控制模块
//!
//! 本模块限制浮出通知的速率并遵守免打扰时段，与队列的投递重试逻辑完全独立。
//!
//! ## 核心功能
//!
//! 1. **滚动计数上限** - 小时桶 / 天桶计数超过上限即拒绝
//! 2. **按类型节流** - 同类型通知之间的最小间隔由优先级决定
//! 3. **免打扰时段** - 命名时段内仅紧急通知（且时段允许时）放行
//! 4. **惰性清理** - 超过保留期的计数桶在记录时顺带清除
//!
//! ## 设计理念
//!
//! - 频率控制保护的是操作员的注意力，不是服务端
//! - 控制结果只影响"是否浮出"，不影响消息投递本身
//!
//! 计数器与免打扰时段整文档持久化到 KV 存储，启动时读回。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::queue::MessagePriority;
use crate::storage::{keys, KvStore};

/// 频率控制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyConfig {
    /// 每小时通知上限
    pub hourly_cap: u32,
    /// 每天通知上限
    pub daily_cap: u32,
    /// 高优先级通知的同类型节流窗口（秒）
    pub throttle_high_secs: i64,
    /// 普通优先级节流窗口（秒）
    pub throttle_medium_secs: i64,
    /// 低优先级节流窗口（秒）
    pub throttle_low_secs: i64,
    /// 小时桶保留时长（小时）
    pub hour_retention_hours: i64,
    /// 天桶保留时长（天）
    pub day_retention_days: i64,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            hourly_cap: 20,
            daily_cap: 100,
            throttle_high_secs: 60,     // 高优先级：1 分钟
            throttle_medium_secs: 300,  // 普通：5 分钟
            throttle_low_secs: 900,     // 低：15 分钟
            hour_retention_hours: 24,
            day_retention_days: 7,
        }
    }
}

impl FrequencyConfig {
    /// 按优先级取节流窗口（秒）；紧急通知不节流
    pub fn throttle_window_secs(&self, priority: MessagePriority) -> i64 {
        match priority {
            MessagePriority::Urgent => 0,
            MessagePriority::High => self.throttle_high_secs,
            MessagePriority::Medium => self.throttle_medium_secs,
            MessagePriority::Low => self.throttle_low_secs,
        }
    }
}

/// 免打扰时段
///
/// `start_minute`/`end_minute` 为一天内的分钟数（0..1440），支持跨午夜
/// （start > end 时视为跨天窗口）。`weekdays` 为周一=0 .. 周日=6。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DndSchedule {
    pub name: String,
    pub start_minute: u32,
    pub end_minute: u32,
    pub weekdays: Vec<u8>,
    /// 时段内是否放行紧急通知
    pub allow_urgent: bool,
}

impl DndSchedule {
    /// 判断给定时刻是否落在本时段内
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let weekday = at.weekday().num_days_from_monday() as u8;
        let minute = at.hour() * 60 + at.minute();

        if self.start_minute <= self.end_minute {
            // 当日窗口
            self.weekdays.contains(&weekday)
                && minute >= self.start_minute
                && minute < self.end_minute
        } else {
            // 跨午夜窗口：前半段看当天，后半段看前一天的配置
            if minute >= self.start_minute {
                self.weekdays.contains(&weekday)
            } else if minute < self.end_minute {
                let prev = (weekday + 6) % 7;
                self.weekdays.contains(&prev)
            } else {
                false
            }
        }
    }
}

/// 拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// 小时上限已到
    HourlyCapReached,
    /// 天上限已到
    DailyCapReached,
    /// 同类型节流窗口内
    Throttled,
    /// 免打扰时段内
    DoNotDisturb,
}

impl SuppressReason {
    pub fn name(&self) -> &'static str {
        match self {
            SuppressReason::HourlyCapReached => "hourly_cap",
            SuppressReason::DailyCapReached => "daily_cap",
            SuppressReason::Throttled => "throttled",
            SuppressReason::DoNotDisturb => "do_not_disturb",
        }
    }
}

/// 频率判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyDecision {
    Allowed,
    Suppressed(SuppressReason),
}

impl FrequencyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, FrequencyDecision::Allowed)
    }
}

/// 持久化的计数器文档
///
/// 布局与本地存储契约一致：小时桶 → 计数、天桶 → 计数、类型 → 最近发送时间。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrequencyCounters {
    /// epoch 小时 → 计数
    pub hour_buckets: HashMap<i64, u32>,
    /// epoch 天 → 计数
    pub day_buckets: HashMap<i64, u32>,
    /// 通知类型 → 最近发送时间（UTC 毫秒）
    pub last_sent_by_type: HashMap<String, i64>,
}

/// 频率控制统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrequencyStats {
    pub allowed_total: u64,
    pub suppressed_total: u64,
    pub suppressed_by_reason: HashMap<String, u64>,
}

/// 通知频率控制器
#[derive(Debug)]
pub struct FrequencyController {
    config: FrequencyConfig,
    counters: RwLock<FrequencyCounters>,
    schedules: RwLock<Vec<DndSchedule>>,
    stats: RwLock<FrequencyStats>,
    kv: Arc<KvStore>,
}

impl FrequencyController {
    /// 从 KV 存储加载计数器与免打扰时段
    pub async fn load(config: FrequencyConfig, kv: Arc<KvStore>) -> Result<Self> {
        let counters: FrequencyCounters = kv
            .get(keys::FREQUENCY_COUNTERS)
            .await?
            .unwrap_or_default();
        let schedules: Vec<DndSchedule> = kv
            .get(keys::DND_SCHEDULES)
            .await?
            .unwrap_or_default();

        info!(
            "通知频率控制器已加载: {} 个小时桶, {} 个免打扰时段",
            counters.hour_buckets.len(),
            schedules.len()
        );

        Ok(Self {
            config,
            counters: RwLock::new(counters),
            schedules: RwLock::new(schedules),
            stats: RwLock::new(FrequencyStats::default()),
            kv,
        })
    }

    /// 判断指定类型/优先级的通知当前是否允许浮出
    pub fn should_allow(
        &self,
        notification_type: &str,
        priority: MessagePriority,
    ) -> FrequencyDecision {
        self.should_allow_at(notification_type, priority, Utc::now())
    }

    /// 同上，显式给定时刻（测试与回放用）
    pub fn should_allow_at(
        &self,
        notification_type: &str,
        priority: MessagePriority,
        now: DateTime<Utc>,
    ) -> FrequencyDecision {
        // 1. 免打扰时段：时段内仅紧急（且时段允许时）放行
        {
            let schedules = self.schedules.read();
            let in_dnd = schedules.iter().find(|s| s.contains(now));
            if let Some(schedule) = in_dnd {
                let urgent_bypass =
                    priority == MessagePriority::Urgent && schedule.allow_urgent;
                if !urgent_bypass {
                    debug!(
                        "免打扰时段 [{}] 内，拒绝 {} 通知",
                        schedule.name, notification_type
                    );
                    return self.suppressed(SuppressReason::DoNotDisturb);
                }
            }
        }

        let counters = self.counters.read();

        // 2. 滚动上限
        let hour_bucket = now.timestamp() / 3_600;
        let day_bucket = now.timestamp() / 86_400;
        if counters.hour_buckets.get(&hour_bucket).copied().unwrap_or(0)
            >= self.config.hourly_cap
        {
            warn!("通知小时上限已到（{}），拒绝 {}", self.config.hourly_cap, notification_type);
            return self.suppressed(SuppressReason::HourlyCapReached);
        }
        if counters.day_buckets.get(&day_bucket).copied().unwrap_or(0) >= self.config.daily_cap {
            warn!("通知天上限已到（{}），拒绝 {}", self.config.daily_cap, notification_type);
            return self.suppressed(SuppressReason::DailyCapReached);
        }

        // 3. 同类型节流窗口
        let window_secs = self.config.throttle_window_secs(priority);
        if window_secs > 0 {
            if let Some(&last_sent) = counters.last_sent_by_type.get(notification_type) {
                let elapsed_ms = now.timestamp_millis() - last_sent;
                if elapsed_ms < window_secs * 1_000 {
                    debug!(
                        "类型 {} 在节流窗口内（还需 {}ms），拒绝",
                        notification_type,
                        window_secs * 1_000 - elapsed_ms
                    );
                    return self.suppressed(SuppressReason::Throttled);
                }
            }
        }

        self.stats.write().allowed_total += 1;
        FrequencyDecision::Allowed
    }

    fn suppressed(&self, reason: SuppressReason) -> FrequencyDecision {
        let mut stats = self.stats.write();
        stats.suppressed_total += 1;
        *stats
            .suppressed_by_reason
            .entry(reason.name().to_string())
            .or_insert(0) += 1;
        FrequencyDecision::Suppressed(reason)
    }

    /// 记录一次已浮出的通知并持久化计数器
    pub async fn record(&self, notification_type: &str, priority: MessagePriority) -> Result<()> {
        self.record_at(notification_type, priority, Utc::now()).await
    }

    /// 同上，显式给定时刻（测试与回放用）
    pub async fn record_at(
        &self,
        notification_type: &str,
        _priority: MessagePriority,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let snapshot = {
            let mut counters = self.counters.write();

            let hour_bucket = now.timestamp() / 3_600;
            let day_bucket = now.timestamp() / 86_400;
            *counters.hour_buckets.entry(hour_bucket).or_insert(0) += 1;
            *counters.day_buckets.entry(day_bucket).or_insert(0) += 1;
            counters
                .last_sent_by_type
                .insert(notification_type.to_string(), now.timestamp_millis());

            // 惰性清理：超过保留期的桶顺带移除
            let min_hour = hour_bucket - self.config.hour_retention_hours;
            let min_day = day_bucket - self.config.day_retention_days;
            counters.hour_buckets.retain(|&bucket, _| bucket >= min_hour);
            counters.day_buckets.retain(|&bucket, _| bucket >= min_day);

            counters.clone()
        };

        // 整文档替换持久化
        self.kv.set(keys::FREQUENCY_COUNTERS, &snapshot).await?;
        Ok(())
    }

    /// 添加免打扰时段并持久化
    pub async fn add_schedule(&self, schedule: DndSchedule) -> Result<()> {
        let snapshot = {
            let mut schedules = self.schedules.write();
            schedules.retain(|s| s.name != schedule.name);
            info!("添加免打扰时段: {}", schedule.name);
            schedules.push(schedule);
            schedules.clone()
        };
        self.kv.set(keys::DND_SCHEDULES, &snapshot).await?;
        Ok(())
    }

    /// 按名称移除免打扰时段
    pub async fn remove_schedule(&self, name: &str) -> Result<bool> {
        let (removed, snapshot) = {
            let mut schedules = self.schedules.write();
            let before = schedules.len();
            schedules.retain(|s| s.name != name);
            (schedules.len() != before, schedules.clone())
        };
        if removed {
            self.kv.set(keys::DND_SCHEDULES, &snapshot).await?;
        }
        Ok(removed)
    }

    /// 当前免打扰时段列表
    pub fn schedules(&self) -> Vec<DndSchedule> {
        self.schedules.read().clone()
    }

    /// 获取统计信息
    pub fn stats(&self) -> FrequencyStats {
        self.stats.read().clone()
    }
}
