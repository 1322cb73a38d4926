use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use conveyor_domain::{
    Broker, Datastore, JobState, Task, TaskHandler, TaskState, QUEUE_PENDING,
};
use conveyor_errors::EngineResult;

/// 任务失败处理器
///
/// 重试额度未用尽时清空结果重新入队；否则任务落为 Failed 并
/// 使所属作业短路失败，由作业处理器取消其余活跃任务。
pub struct FailedTaskHandler {
    datastore: Arc<dyn Datastore>,
    broker: Arc<dyn Broker>,
}

impl FailedTaskHandler {
    pub fn new(datastore: Arc<dyn Datastore>, broker: Arc<dyn Broker>) -> Self {
        Self { datastore, broker }
    }
}

#[async_trait]
impl TaskHandler for FailedTaskHandler {
    async fn handle(&self, task: Task) -> EngineResult<()> {
        let current = self.datastore.get_task_by_id(&task.id).await?;
        if current.is_terminal() {
            debug!("任务 {} 已处于终态，忽略失败上报", current.id);
            return Ok(());
        }
        let error = task
            .error
            .clone()
            .unwrap_or_else(|| "未知错误".to_string());

        if current.can_retry() {
            self.datastore
                .update_task(
                    &current.id,
                    Box::new(|u| {
                        if u.is_terminal() {
                            return Ok(());
                        }
                        if let Some(retry) = &mut u.retry {
                            retry.attempts += 1;
                        }
                        u.state = TaskState::Pending;
                        u.error = None;
                        u.result = None;
                        u.node_id = None;
                        u.started_at = None;
                        Ok(())
                    }),
                )
                .await?;
            let retried = self.datastore.get_task_by_id(&current.id).await?;
            info!(
                "任务 {} 重新入队重试（已尝试 {} 次）: {}",
                retried.id,
                retried.retry.as_ref().map(|r| r.attempts).unwrap_or(0),
                error
            );
            self.broker.publish_task(QUEUE_PENDING, &retried).await?;
            return Ok(());
        }

        warn!("任务 {} 失败且重试额度用尽: {}", current.id, error);
        let now = Utc::now();
        let task_error = error.clone();
        self.datastore
            .update_task(
                &current.id,
                Box::new(move |u| {
                    if !u.is_terminal() {
                        u.state = TaskState::Failed;
                        u.failed_at = Some(now);
                        u.error = Some(task_error);
                    }
                    Ok(())
                }),
            )
            .await?;

        // 任务失败短路所属作业
        let job_error = error.clone();
        match self
            .datastore
            .update_job(
                &current.job_id,
                Box::new(move |j| {
                    if !j.is_terminal() {
                        j.state = JobState::Failed;
                        j.failed_at = Some(now);
                        j.error = Some(job_error);
                    }
                    Ok(())
                }),
            )
            .await
        {
            Ok(()) => {
                let job = self.datastore.get_job_by_id(&current.job_id).await?;
                self.broker.publish_job(&job).await?;
            }
            Err(e) if e.is_not_found() => {
                warn!("失败任务 {} 所属作业不存在", current.id);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}
