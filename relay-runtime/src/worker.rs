//! 后台周期任务
//!
//! 生产者的定时刷新、DLQ 的重试与过期清理都是独立的周期任务：
//! 可取消，且关闭时必须等待其退出。
//!
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// 周期任务的最小周期
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// 周期执行 `f`，直到 `token` 被取消
///
/// 首个 tick 在一个周期之后触发；上一轮未完成时跳过错过的 tick。
/// 周期为零时按 [`MIN_PERIOD`] 执行。
pub fn spawn_periodic<F, Fut>(token: CancellationToken, interval: Duration, mut f: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let interval = if interval.is_zero() {
        tracing::warn!(min = ?MIN_PERIOD, "zero period for background task, clamped");
        MIN_PERIOD
    } else {
        interval
    };

    tokio::spawn(async move {
        let start = time::Instant::now() + interval;
        let mut ticker = time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => f().await,
            }
        }
    })
}

/// 一组后台任务的句柄：用于关闭与等待任务结束
#[derive(Default)]
pub struct WorkerHandle {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn spawn_periodic<F, Fut>(&self, interval: Duration, f: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = spawn_periodic(self.token.clone(), interval, f);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    pub fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// 取消并等待全部任务退出；可重复调用
    pub async fn shutdown_and_join(&self) {
        self.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));

        for t in tasks {
            if let Err(e) = t.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "background task panicked");
                }
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_until_cancelled() {
        let handle = WorkerHandle::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        handle.spawn_periodic(Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        handle.shutdown_and_join().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        assert!(handle.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_is_clamped_instead_of_panicking() {
        let handle = WorkerHandle::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        handle.spawn_periodic(Duration::ZERO, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ticks.load(Ordering::SeqCst) > 0);
        handle.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let handle = WorkerHandle::new();
        handle.spawn_periodic(Duration::from_millis(5), || async {});
        handle.shutdown_and_join().await;
        handle.shutdown_and_join().await;
    }
}
