//! 指数退避
//!
//! `delay(n) = base * multiplier^n`，可选上限；生产者、消费者、DLQ 与死信处理器共用。
//!
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Option<Duration>,
}

impl Backoff {
    /// 倍数为 2 的指数退避
    pub fn exponential(base: Duration) -> Self {
        Self {
            base,
            multiplier: 2.0,
            max: None,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    /// 第 `attempt` 次（从 0 开始）之后的等待时长；不随 `attempt` 递减
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exp);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}
