//! 镜像拉取合并
//!
//! 进程内同一时刻最多一个拉取在途，避免打满网络接口与镜像仓库。
//! 已拉取的镜像直接放行。

use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::Semaphore;
use tracing::debug;

use conveyor_errors::{EngineError, EngineResult};

/// 单航道镜像拉取守卫
pub struct ImagePuller {
    permit: Semaphore,
    pulled: Mutex<HashSet<String>>,
}

impl ImagePuller {
    pub fn new() -> Self {
        Self {
            permit: Semaphore::new(1),
            pulled: Mutex::new(HashSet::new()),
        }
    }

    /// 镜像未拉取过时执行 `pull`，全程持有唯一拉取许可
    pub async fn pull_with<F, Fut>(&self, image: &str, pull: F) -> EngineResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<()>>,
    {
        if self.is_pulled(image) {
            return Ok(());
        }
        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|e| EngineError::internal(format!("拉取信号量已关闭: {e}")))?;
        // 等待许可期间可能已被并发拉取完成
        if self.is_pulled(image) {
            return Ok(());
        }
        debug!("Pulling image {}", image);
        pull().await?;
        self.pulled.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    fn is_pulled(&self, image: &str) -> bool {
        self.pulled.lock().unwrap().contains(image)
    }
}

impl Default for ImagePuller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pull_runs_once_per_image() {
        let puller = Arc::new(ImagePuller::new());
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let count = count.clone();
            puller
                .pull_with("alpine:3.18", || async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_pulls_coalesce() {
        let puller = Arc::new(ImagePuller::new());
        let count = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let puller = puller.clone();
            let count = count.clone();
            let in_flight = in_flight.clone();
            handles.push(tokio::spawn(async move {
                puller
                    .pull_with("busybox:latest", || async move {
                        let concurrent = in_flight.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(concurrent, 0, "multiple pulls in flight");
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_pull_is_retried_next_time() {
        let puller = ImagePuller::new();
        let result = puller
            .pull_with("broken:latest", || async {
                Err(EngineError::unavailable("registry down"))
            })
            .await;
        assert!(result.is_err());

        let count = AtomicUsize::new(0);
        puller
            .pull_with("broken:latest", || async {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
