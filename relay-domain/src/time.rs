//! 时间换算辅助：std `Duration` 与 chrono 时间点之间的饱和运算

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// `ts + d`，溢出时饱和到最大时间点
pub fn after(ts: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    ts.checked_add_signed(delta(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `ts - d`，溢出时饱和到最小时间点
pub fn before(ts: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    ts.checked_sub_signed(delta(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
