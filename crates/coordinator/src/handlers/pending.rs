use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use conveyor_domain::{
    Broker, Datastore, JobContext, JobState, Task, TaskHandler, TaskState, QUEUE_COMPLETED,
    QUEUE_DEFAULT,
};
use conveyor_errors::EngineResult;
use conveyor_eval::Evaluator;

/// 挂起任务处理器
///
/// 求值 `if` 条件：为假则跳过并发布完成事件，让兄弟/父级逻辑
/// 继续推进；否则渲染模板字段、转入 Scheduled 并发布到默认
/// 派发队列。
pub struct PendingTaskHandler {
    datastore: Arc<dyn Datastore>,
    broker: Arc<dyn Broker>,
    evaluator: Evaluator,
}

impl PendingTaskHandler {
    pub fn new(datastore: Arc<dyn Datastore>, broker: Arc<dyn Broker>) -> Self {
        Self {
            datastore,
            broker,
            evaluator: Evaluator::new(),
        }
    }

    async fn job_context(&self, job_id: &str) -> EngineResult<JobContext> {
        match self.datastore.get_job_by_id(job_id).await {
            Ok(job) => Ok(job.context),
            Err(e) if e.is_not_found() => Ok(JobContext::default()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl TaskHandler for PendingTaskHandler {
    async fn handle(&self, task: Task) -> EngineResult<()> {
        let task = self.datastore.get_task_by_id(&task.id).await?;
        if task.is_terminal() {
            debug!("任务 {} 已处于终态，忽略挂起事件", task.id);
            return Ok(());
        }
        let context = self.job_context(&task.job_id).await?;

        if let Some(expr) = task.if_expr.clone().filter(|e| !e.trim().is_empty()) {
            if !self.evaluator.eval_bool(&expr, &context)? {
                info!("任务 {} 的条件为假，跳过执行", task.id);
                let now = Utc::now();
                self.datastore
                    .update_task(
                        &task.id,
                        Box::new(move |u| {
                            if !u.is_terminal() {
                                u.state = TaskState::Skipped;
                                u.completed_at = Some(now);
                            }
                            Ok(())
                        }),
                    )
                    .await?;
                let skipped = self.datastore.get_task_by_id(&task.id).await?;
                self.broker.publish_task(QUEUE_COMPLETED, &skipped).await?;
                return Ok(());
            }
        }

        let mut evaluated = task.clone();
        self.evaluator.evaluate_task(&mut evaluated, &context)?;

        let now = Utc::now();
        self.datastore
            .update_task(
                &task.id,
                Box::new(move |u| {
                    if u.is_terminal() {
                        return Ok(());
                    }
                    *u = evaluated;
                    u.state = TaskState::Scheduled;
                    u.scheduled_at = Some(now);
                    Ok(())
                }),
            )
            .await?;

        // 首个任务派发时把作业带入 Running
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

        let scheduled = self.datastore.get_task_by_id(&task.id).await?;
        self.broker.publish_task(QUEUE_DEFAULT, &scheduled).await?;
        Ok(())
    }
}
