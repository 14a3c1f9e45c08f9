//! 运行时配置
//!
//! 每个服务一个配置结构体，`Default` 即文档默认值；整体可由 JSON 文件加载。
//! 时长字段使用 humantime 格式，如 `"500ms"` / `"60s"` / `"5m"` / `"1h"` / `"7d"`。
//!
use relay_domain::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 指向 JSON 配置文件的环境变量
pub const CONFIG_ENV: &str = "RELAY_CONFIG";

/// 生产者配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// 批次达到该大小立即刷新
    pub batch_size: usize,
    /// 批次最长等待时间
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Duration,
    /// 单事件发布的总尝试次数
    pub retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    pub enable_batching: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_secs(1),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            enable_batching: true,
        }
    }
}

/// 消费者配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// 持久订阅名前缀
    pub consumer_name: String,
    /// 同时处理的消息上限
    pub max_concurrent_events: usize,
    /// 单次处理器调用的超时
    #[serde(with = "humantime_serde")]
    pub event_timeout: Duration,
    /// 单条消息的总尝试次数
    pub retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    pub enable_dlq: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_name: "relay-consumer".to_string(),
            max_concurrent_events: 10,
            event_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            enable_dlq: true,
        }
    }
}

/// 进程内 DLQ 配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// 新条目的镜像主题
    pub dlq_subject: String,
    pub max_retry_attempts: u32,
    /// 退避基数
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    pub retry_backoff_multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
    pub max_dlq_size: usize,
    #[serde(with = "humantime_serde")]
    pub retention_period: Duration,
    pub enable_auto_retry: bool,
    /// 重试扫描周期
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// 过期清理周期
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            dlq_subject: "dlq.events".to_string(),
            max_retry_attempts: 3,
            retry_delay: Duration::from_secs(60),
            retry_backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(24 * 3600),
            max_dlq_size: 10_000,
            retention_period: Duration::from_secs(7 * 24 * 3600),
            enable_auto_retry: true,
            retry_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

/// broker 死信处理器配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqProcessorConfig {
    pub retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
    /// 永久失败记录的保留期
    #[serde(with = "humantime_serde")]
    pub failure_retention: Duration,
}

impl Default for DlqProcessorConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(300),
            failure_retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// 全部服务配置
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub dlq: DlqConfig,
    pub processor: DlqProcessorConfig,
}

impl RelayConfig {
    /// 先加载 `.env`，再读取 `RELAY_CONFIG` 指向的 JSON 文件；未设置时使用默认值
    pub fn from_env() -> RelayResult<Self> {
        dotenvy::dotenv().ok();

        let config = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> RelayResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RelayError::invalid_value(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> RelayResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| RelayError::invalid_value(format!("invalid relay config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RelayResult<()> {
        let checks = [
            (self.producer.batch_size == 0, "producer.batch_size must be > 0"),
            (self.producer.retry_attempts == 0, "producer.retry_attempts must be > 0"),
            (self.producer.batch_timeout.is_zero(), "producer.batch_timeout must be > 0"),
            (
                self.consumer.max_concurrent_events == 0,
                "consumer.max_concurrent_events must be > 0",
            ),
            (self.consumer.retry_attempts == 0, "consumer.retry_attempts must be > 0"),
            (self.dlq.max_dlq_size == 0, "dlq.max_dlq_size must be > 0"),
            (
                self.dlq.retry_backoff_multiplier.is_nan() || self.dlq.retry_backoff_multiplier < 1.0,
                "dlq.retry_backoff_multiplier must be >= 1.0",
            ),
            (self.dlq.retry_interval.is_zero(), "dlq.retry_interval must be > 0"),
            (self.dlq.cleanup_interval.is_zero(), "dlq.cleanup_interval must be > 0"),
            (self.processor.retry_attempts == 0, "processor.retry_attempts must be > 0"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(RelayError::invalid_value(*reason)),
            None => Ok(()),
        }
    }
}
