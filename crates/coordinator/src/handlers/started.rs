use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use conveyor_domain::{
    node_queue, parse_duration, Broker, Datastore, JobState, Task, TaskHandler, TaskState,
};
use conveyor_errors::EngineResult;

/// 任务开始执行处理器
///
/// 登记 Running 状态与执行节点；任务声明了 `timeout` 时启动
/// 看门狗，超时后发布取消。
pub struct StartedTaskHandler {
    datastore: Arc<dyn Datastore>,
    broker: Arc<dyn Broker>,
}

impl StartedTaskHandler {
    pub fn new(datastore: Arc<dyn Datastore>, broker: Arc<dyn Broker>) -> Self {
        Self { datastore, broker }
    }

    fn spawn_watchdog(&self, task_id: String, job_id: String, timeout: std::time::Duration) {
        let datastore = self.datastore.clone();
        let broker = self.broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let task = match datastore.get_task_by_id(&task_id).await {
                Ok(task) => task,
                Err(_) => return,
            };
            if task.is_terminal() {
                return;
            }
            warn!("任务 {} 超过时限，发布取消", task_id);
            let now = Utc::now();
            if let Err(e) = datastore
                .update_task(
                    &task_id,
                    Box::new(move |u| {
                        if !u.is_terminal() {
                            u.state = TaskState::Cancelled;
                            u.failed_at = Some(now);
                        }
                        Ok(())
                    }),
                )
                .await
            {
                warn!("登记任务 {} 取消状态失败: {}", task_id, e);
                return;
            }
            // 通知节点停止容器
            if let Some(node_id) = &task.node_id {
                let mut cancel = task.clone();
                cancel.state = TaskState::Cancelled;
                if let Err(e) = broker.publish_task(&node_queue(node_id), &cancel).await {
                    warn!("向节点 {} 发布取消失败: {}", node_id, e);
                }
            }
            // 超时取消级联到所属作业
            if let Ok(mut job) = datastore.get_job_by_id(&job_id).await {
                if !job.is_terminal() {
                    job.state = JobState::Cancelled;
                    if let Err(e) = broker.publish_job(&job).await {
                        warn!("发布作业 {} 取消请求失败: {}", job_id, e);
                    }
                }
            }
        });
    }
}

#[async_trait]
impl TaskHandler for StartedTaskHandler {
    async fn handle(&self, task: Task) -> EngineResult<()> {
        let now = Utc::now();
        let node_id = task.node_id.clone();
        let started_at = task.started_at.unwrap_or(now);
        self.datastore
            .update_task(
                &task.id,
                Box::new(move |u| {
                    // 开始上报晚于取消到达时维持终态
                    if u.is_terminal() {
                        return Ok(());
                    }
                    u.state = TaskState::Running;
                    u.started_at = Some(started_at);
                    u.node_id = node_id;
                    Ok(())
                }),
            )
            .await?;

        if let Err(e) = self
            .datastore
            .update_job(
                &task.job_id,
                Box::new(move |j| {
                    if !j.is_terminal() && j.state != JobState::Running {
                        j.state = JobState::Running;
                        j.started_at.get_or_insert(now);
                    }
                    Ok(())
                }),
            )
            .await
        {
            if !e.is_not_found() {
                return Err(e);
            }
        }

        let current = self.datastore.get_task_by_id(&task.id).await?;
        if current.state != TaskState::Running {
            debug!("任务 {} 未进入 Running，跳过看门狗", task.id);
            return Ok(());
        }
        if let Some(timeout) = current.timeout.clone().filter(|t| !t.is_empty()) {
            match parse_duration(&timeout) {
                Ok(duration) => {
                    debug!("任务 {} 启动 {} 看门狗", task.id, timeout);
                    self.spawn_watchdog(current.id.clone(), current.job_id.clone(), duration);
                }
                Err(e) => warn!("任务 {} 的超时配置无效: {}", task.id, e),
            }
        }
        Ok(())
    }
}
