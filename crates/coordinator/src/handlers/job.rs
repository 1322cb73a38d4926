use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use conveyor_domain::{
    node_queue, Broker, Datastore, Job, JobHandler, JobState, TaskState, QUEUE_COMPLETED,
    QUEUE_ERROR, QUEUE_PENDING,
};
use conveyor_errors::EngineResult;
use conveyor_eval::Evaluator;

use super::instantiate;
use crate::webhook::WebhookNotifier;

/// 作业生命周期处理器
///
/// Pending 消息启动作业；Completed/Failed 消息处理子作业的父任务
/// 推进并发出回调；Cancelled 消息视为取消请求，取消全部活跃任务
/// 并通知其所在节点。
pub struct JobLifecycleHandler {
    datastore: Arc<dyn Datastore>,
    broker: Arc<dyn Broker>,
    evaluator: Evaluator,
    webhooks: WebhookNotifier,
}

impl JobLifecycleHandler {
    pub fn new(datastore: Arc<dyn Datastore>, broker: Arc<dyn Broker>) -> Self {
        Self {
            datastore,
            broker,
            evaluator: Evaluator::new(),
            webhooks: WebhookNotifier::new(),
        }
    }

    async fn start_job(&self, job_id: &str) -> EngineResult<()> {
        let job = self.datastore.get_job_by_id(job_id).await?;
        if job.state != JobState::Pending {
            debug!("作业 {} 已启动，忽略重复的启动事件", job.id);
            return Ok(());
        }
        if job.tasks.is_empty() {
            let now = Utc::now();
            self.datastore
                .update_job(
                    &job.id,
                    Box::new(move |j| {
                        if !j.is_terminal() {
                            j.state = JobState::Completed;
                            j.completed_at = Some(now);
                        }
                        Ok(())
                    }),
                )
                .await?;
            let job = self.datastore.get_job_by_id(&job.id).await?;
            self.broker.publish_job(&job).await?;
            return Ok(());
        }

        let first = instantiate(&job.tasks[0], &job.id, 1);
        let created = self.datastore.create_task(&first).await?;
        let now = Utc::now();
        self.datastore
            .update_job(
                &job.id,
                Box::new(move |j| {
                    if j.state == JobState::Pending {
                        j.state = JobState::Running;
                        j.started_at = Some(now);
                        j.position = 1;
                        j.task_count += 1;
                    }
                    Ok(())
                }),
            )
            .await?;
        info!("作业 {} 启动，共 {} 个根任务", job.id, job.tasks.len());
        self.broker.publish_task(QUEUE_PENDING, &created).await?;
        Ok(())
    }

    async fn on_completed(&self, job_id: &str) -> EngineResult<()> {
        let job = self.datastore.get_job_by_id(job_id).await?;
        if let Some(parent_task_id) = job.parent_id.clone().filter(|_| !job.detached) {
            match self.datastore.get_task_by_id(&parent_task_id).await {
                Ok(parent) if !parent.is_terminal() => {
                    let output = match job.output.clone().filter(|o| !o.is_empty()) {
                        Some(expr) => Some(self.evaluator.render(&expr, &job.context)?),
                        None => None,
                    };
                    if let Some(output) = &output {
                        let name = job.name.clone();
                        let value = output.clone();
                        // 子作业输出并入父作业上下文
                        if let Err(e) = self
                            .datastore
                            .update_job(
                                &parent.job_id,
                                Box::new(move |j| {
                                    j.context.outputs.insert(name, value);
                                    Ok(())
                                }),
                            )
                            .await
                        {
                            if !e.is_not_found() {
                                return Err(e);
                            }
                        }
                    }
                    let result = output.clone();
                    self.datastore
                        .update_task(
                            &parent.id,
                            Box::new(move |u| {
                                if result.is_some() {
                                    u.result = result;
                                }
                                Ok(())
                            }),
                        )
                        .await?;
                    let parent = self.datastore.get_task_by_id(&parent.id).await?;
                    info!("子作业 {} 完成，推进父任务 {}", job.id, parent.id);
                    self.broker.publish_task(QUEUE_COMPLETED, &parent).await?;
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    warn!("子作业 {} 的父任务 {} 不存在", job.id, parent_task_id);
                }
                Err(e) => return Err(e),
            }
        }
        self.webhooks.notify(&job);
        Ok(())
    }

    async fn on_failed(&self, job_id: &str) -> EngineResult<()> {
        let job = self.datastore.get_job_by_id(job_id).await?;
        self.cancel_active_tasks(&job.id).await?;
        if let Some(parent_task_id) = &job.parent_id {
            match self.datastore.get_task_by_id(parent_task_id).await {
                Ok(parent) if !parent.is_terminal() => {
                    let mut failed = parent.clone();
                    failed.error = job
                        .error
                        .clone()
                        .or_else(|| Some(format!("子作业 {} 失败", job.id)));
                    warn!("子作业 {} 失败，父任务 {} 随之失败", job.id, parent.id);
                    self.broker.publish_task(QUEUE_ERROR, &failed).await?;
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        self.webhooks.notify(&job);
        Ok(())
    }

    async fn on_cancel(&self, job_id: &str) -> EngineResult<()> {
        let now = Utc::now();
        self.datastore
            .update_job(
                job_id,
                Box::new(move |j| {
                    if !j.is_terminal() {
                        j.state = JobState::Cancelled;
                        j.failed_at = Some(now);
                    }
                    Ok(())
                }),
            )
            .await?;
        let job = self.datastore.get_job_by_id(job_id).await?;
        if job.state != JobState::Cancelled {
            debug!("作业 {} 已以 {:?} 终结，忽略取消请求", job.id, job.state);
            return Ok(());
        }
        info!("作业 {} 已取消", job.id);
        self.cancel_active_tasks(&job.id).await?;
        self.webhooks.notify(&job);
        Ok(())
    }

    /// 取消作业的全部活跃任务并通知其所在节点
    async fn cancel_active_tasks(&self, job_id: &str) -> EngineResult<()> {
        let active = self.datastore.get_active_tasks(job_id).await?;
        let count = active.len();
        for task in active {
            let now = Utc::now();
            self.datastore
                .update_task(
                    &task.id,
                    Box::new(move |u| {
                        if !u.is_terminal() {
                            u.state = TaskState::Cancelled;
                            u.failed_at = Some(now);
                        }
                        Ok(())
                    }),
                )
                .await?;
            if let Some(node_id) = &task.node_id {
                let mut cancel = task.clone();
                cancel.state = TaskState::Cancelled;
                self.broker
                    .publish_task(&node_queue(node_id), &cancel)
                    .await?;
            }
        }
        if count > 0 {
            info!("作业 {} 的 {} 个活跃任务已取消", job_id, count);
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for JobLifecycleHandler {
    async fn handle(&self, job: Job) -> EngineResult<()> {
        match job.state {
            JobState::Pending => self.start_job(&job.id).await,
            JobState::Completed => self.on_completed(&job.id).await,
            JobState::Failed => self.on_failed(&job.id).await,
            JobState::Cancelled => self.on_cancel(&job.id).await,
            JobState::Scheduled | JobState::Running => {
                debug!("忽略作业 {} 的 {:?} 事件", job.id, job.state);
                Ok(())
            }
        }
    }
}
