//! 异步并发闸门
//!
//! 基于 `tokio::sync::Semaphore` 的固定许可数闸门。等待者按 FIFO 顺序获得许可，
//! 被取消的等待不会占用许可。

use std::future::Future;
use tokio::sync::{Semaphore, SemaphorePermit};

pub struct AsyncGate {
    capacity: usize,
    semaphore: Semaphore,
}

impl AsyncGate {
    pub fn new(permits: usize) -> Self {
        let capacity = permits.max(1);
        Self {
            capacity,
            semaphore: Semaphore::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前空闲许可数
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 获取一个许可，必须配对调用 `release`
    pub async fn acquire(&self) {
        // 信号量不会被关闭
        if let Ok(permit) = self.semaphore.acquire().await {
            permit.forget();
        }
    }

    /// 归还许可，空闲数不会超过容量
    pub fn release(&self) {
        if self.semaphore.available_permits() < self.capacity {
            self.semaphore.add_permits(1);
        }
    }

    /// RAII 形式的获取，guard 释放时归还许可
    pub async fn acquire_guard(&self) -> Option<GatePermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .ok()
            .map(|permit| GatePermit { _permit: permit })
    }

    /// 在闸门内执行一段异步工作，正常返回、出错或被取消都会归还许可
    pub async fn run<F, T>(&self, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire_guard().await;
        work.await
    }
}

pub struct GatePermit<'a> {
    _permit: SemaphorePermit<'a>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_never_exceeds_capacity() {
        let gate = Arc::new(AsyncGate::new(3));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let gate = gate.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                gate.run(async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(gate.available(), 3);
    }

    #[tokio::test]
    async fn test_waiters_wake_in_fifo_order() {
        let gate = Arc::new(AsyncGate::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let queued = Arc::new(AtomicUsize::new(0));

        gate.acquire().await;

        let mut handles = Vec::new();
        for id in 0..3 {
            let task_gate = gate.clone();
            let order = order.clone();
            let task_queued = queued.clone();
            handles.push(tokio::spawn(async move {
                task_queued.fetch_add(1, Ordering::SeqCst);
                task_gate.acquire().await;
                order.lock().unwrap().push(id);
                task_gate.release();
            }));
            // 让新任务先排进队列
            while queued.load(Ordering::SeqCst) < id + 1 {
                tokio::task::yield_now().await;
            }
            tokio::task::yield_now().await;
        }

        gate.release();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_release_on_error_exit() {
        let gate = AsyncGate::new(1);

        let result: Result<(), &str> = gate.run(async { Err("boom") }).await;
        assert!(result.is_err());
        assert_eq!(gate.available(), 1);

        {
            let _permit = gate.acquire_guard().await;
            assert_eq!(gate.available(), 0);
        }
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_release_never_exceeds_capacity() {
        let gate = AsyncGate::new(2);
        gate.release();
        assert_eq!(gate.available(), 2);

        gate.acquire().await;
        gate.release();
        gate.release();
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_leak_permit() {
        let gate = Arc::new(AsyncGate::new(1));
        gate.acquire().await;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        gate.release();
        assert_eq!(gate.available(), 1);
    }
}
