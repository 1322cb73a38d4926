//! 嵌入式引擎装配
//!
//! 在单进程内装配数据存储、消息队列、协调器与工作节点。独立
//! 部署时按模式只启动其中一部分，共享同一个消息队列接入点。

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use conveyor_coordinator::{Coordinator, CoordinatorConfig};
use conveyor_domain::{Broker, Datastore, Job, JobState};
use conveyor_errors::{EngineError, EngineResult};
use conveyor_infrastructure::{InMemoryBroker, InMemoryDatastore};
use conveyor_input::{validate_job, JobInput};
use conveyor_runtime::ShellRuntime;
use conveyor_worker::Worker;

use crate::config::EngineConfig;

/// 引擎运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// 协调器与工作节点同进程
    Standalone,
    /// 仅协调器
    Coordinator,
    /// 仅工作节点
    Worker,
}

/// 嵌入式引擎
pub struct Engine {
    datastore: Arc<InMemoryDatastore>,
    broker: Arc<InMemoryBroker>,
    worker: Option<Arc<Worker>>,
}

impl Engine {
    /// 按配置与模式装配并启动引擎
    pub async fn start(config: &EngineConfig, mode: EngineMode) -> EngineResult<Self> {
        info!("装配引擎，模式 {:?}", mode);
        let datastore = Arc::new(InMemoryDatastore::with_config(config.datastore_config()?));
        let broker = Arc::new(InMemoryBroker::new());
        let ds: Arc<dyn Datastore> = datastore.clone();
        let bk: Arc<dyn Broker> = broker.clone();

        if mode != EngineMode::Worker {
            let coordinator = Coordinator::with_config(
                ds.clone(),
                bk.clone(),
                CoordinatorConfig {
                    heartbeat_interval: config.heartbeat_interval()?,
                },
            );
            coordinator.start().await?;
        }

        let worker = if mode != EngineMode::Coordinator {
            let runtime = Arc::new(ShellRuntime::new());
            let worker = Arc::new(Worker::with_config(
                bk.clone(),
                runtime,
                config.worker_config()?,
            ));
            worker.start().await?;
            Some(worker)
        } else {
            None
        };

        Ok(Self {
            datastore,
            broker,
            worker,
        })
    }

    pub fn datastore(&self) -> Arc<dyn Datastore> {
        self.datastore.clone()
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    /// 校验并提交作业，返回已登记的作业
    pub async fn submit_job(&self, input: &JobInput) -> EngineResult<Job> {
        validate_job(input)?;
        let job = input.to_job();
        let created = self.datastore.create_job(&job).await?;
        self.broker.publish_job(&created).await?;
        info!("作业 {} ({}) 已提交", created.id, created.name);
        Ok(created)
    }

    /// 请求取消作业
    pub async fn cancel_job(&self, job_id: &str) -> EngineResult<()> {
        let mut job = self.datastore.get_job_by_id(job_id).await?;
        if job.is_terminal() {
            return Err(EngineError::validation(format!(
                "作业 {job_id} 已终结，无法取消"
            )));
        }
        job.state = JobState::Cancelled;
        self.broker.publish_job(&job).await
    }

    /// 轮询等待作业终结
    pub async fn wait_for_job(&self, job_id: &str, timeout: Duration) -> EngineResult<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.datastore.get_job_by_id(job_id).await?;
            if job.is_terminal() {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Timeout(format!(
                    "等待作业 {job_id} 结束超时"
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn stop(&self) -> EngineResult<()> {
        if let Some(worker) = &self.worker {
            worker.stop().await?;
        }
        self.broker.shutdown().await?;
        info!("引擎已停止");
        Ok(())
    }
}
