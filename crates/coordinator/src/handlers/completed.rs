use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use conveyor_domain::{
    Broker, Datastore, JobState, Task, TaskHandler, TaskState, QUEUE_COMPLETED, QUEUE_PENDING,
};
use conveyor_errors::EngineResult;

use super::instantiate;

/// 任务完成处理器
///
/// 完成链路按固定顺序推进：登记终态、`var` 捕获写入作业上下文、
/// 父级记账（并行/迭代计数、节流释放、子作业输出）、顺序链推进、
/// 根任务则推进作业的模板序列或完成作业。父级的完成不在此递归，
/// 而是把父任务重新发布到完成队列，保持事件粒度。
pub struct CompletedTaskHandler {
    datastore: Arc<dyn Datastore>,
    broker: Arc<dyn Broker>,
}

impl CompletedTaskHandler {
    pub fn new(datastore: Arc<dyn Datastore>, broker: Arc<dyn Broker>) -> Self {
        Self { datastore, broker }
    }

    async fn complete_parallel_child(&self, parent_id: &str) -> EngineResult<()> {
        self.datastore
            .update_task(
                parent_id,
                Box::new(|u| {
                    if let Some(parallel) = &mut u.parallel {
                        parallel.completions += 1;
                    }
                    Ok(())
                }),
            )
            .await?;
        let parent = self.datastore.get_task_by_id(parent_id).await?;
        if let Some(parallel) = &parent.parallel {
            if parallel.completions >= parallel.tasks.len() && !parent.is_terminal() {
                debug!(
                    "并行任务 {} 的 {} 个子任务全部完成",
                    parent.id, parallel.completions
                );
                self.broker.publish_task(QUEUE_COMPLETED, &parent).await?;
            }
        }
        Ok(())
    }

    async fn complete_each_child(&self, parent_id: &str) -> EngineResult<()> {
        self.datastore
            .update_task(
                parent_id,
                Box::new(|u| {
                    if let Some(each) = &mut u.each {
                        each.completions += 1;
                    }
                    Ok(())
                }),
            )
            .await?;
        let parent = self.datastore.get_task_by_id(parent_id).await?;

        // 节流释放下一个排队元素
        match self.datastore.get_next_task(&parent.id).await {
            Ok(next) => {
                self.datastore
                    .update_task(
                        &next.id,
                        Box::new(|u| {
                            if u.state == TaskState::Created {
                                u.state = TaskState::Pending;
                            }
                            Ok(())
                        }),
                    )
                    .await?;
                let next = self.datastore.get_task_by_id(&next.id).await?;
                if next.state == TaskState::Pending {
                    self.broker.publish_task(QUEUE_PENDING, &next).await?;
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if let Some(each) = &parent.each {
            if each.completions >= each.size && !parent.is_terminal() {
                debug!(
                    "each 任务 {} 的 {} 个子任务全部完成",
                    parent.id, each.completions
                );
                self.broker.publish_task(QUEUE_COMPLETED, &parent).await?;
            }
        }
        Ok(())
    }

    /// 顺序链推进：发布当前任务的下一个 Created 子任务
    async fn advance_chain(&self, task: &Task) -> EngineResult<()> {
        match self.datastore.get_next_task(&task.id).await {
            Ok(next) => {
                self.datastore
                    .update_task(
                        &next.id,
                        Box::new(|u| {
                            if u.state == TaskState::Created {
                                u.state = TaskState::Pending;
                            }
                            Ok(())
                        }),
                    )
                    .await?;
                let next = self.datastore.get_task_by_id(&next.id).await?;
                if next.state == TaskState::Pending {
                    self.broker.publish_task(QUEUE_PENDING, &next).await?;
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 根任务完成：实例化下一个模板或完成作业
    async fn advance_job(&self, task: &Task) -> EngineResult<()> {
        let job = match self.datastore.get_job_by_id(&task.job_id).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                warn!("任务 {} 所属作业 {} 不存在", task.id, task.job_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if job.is_terminal() {
            return Ok(());
        }

        if job.position < job.tasks.len() {
            let next = instantiate(&job.tasks[job.position], &job.id, job.position + 1);
            let created = self.datastore.create_task(&next).await?;
            self.datastore
                .update_job(
                    &job.id,
                    Box::new(|j| {
                        j.position += 1;
                        j.task_count += 1;
                        Ok(())
                    }),
                )
                .await?;
            self.broker.publish_task(QUEUE_PENDING, &created).await?;
        } else {
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
            info!("作业 {} 的全部任务已完成", job.id);
            self.broker.publish_job(&job).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for CompletedTaskHandler {
    async fn handle(&self, task: Task) -> EngineResult<()> {
        let current = self.datastore.get_task_by_id(&task.id).await?;
        // 重放防护：除 Skipped 外的终态任务不再推进
        if current.is_terminal() && current.state != TaskState::Skipped {
            debug!("任务 {} 已处于终态，忽略完成事件", current.id);
            return Ok(());
        }

        if !current.is_terminal() {
            let now = Utc::now();
            let completed_at = task.completed_at.unwrap_or(now);
            let result = task.result.clone();
            self.datastore
                .update_task(
                    &current.id,
                    Box::new(move |u| {
                        if u.is_terminal() {
                            return Ok(());
                        }
                        u.state = TaskState::Completed;
                        u.completed_at = Some(completed_at);
                        if result.is_some() {
                            u.result = result;
                        }
                        Ok(())
                    }),
                )
                .await?;
        }
        let current = self.datastore.get_task_by_id(&current.id).await?;
        info!("任务 {} 以 {:?} 结束", current.id, current.state);

        if let Some(var) = current.var.clone().filter(|v| !v.is_empty()) {
            let value = current.result.clone().unwrap_or_default();
            if let Err(e) = self
                .datastore
                .update_job(
                    &current.job_id,
                    Box::new(move |j| {
                        j.context.tasks.insert(var, value);
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

        match current.parent_id.clone() {
            Some(parent_id) => match self.datastore.get_task_by_id(&parent_id).await {
                Ok(parent) if parent.parallel.is_some() => {
                    self.complete_parallel_child(&parent.id).await
                }
                Ok(parent) if parent.each.is_some() => {
                    self.complete_each_child(&parent.id).await
                }
                Ok(_) => self.advance_chain(&current).await,
                Err(e) if e.is_not_found() => {
                    warn!("任务 {} 的父任务 {} 不存在", current.id, parent_id);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            None => self.advance_job(&current).await,
        }
    }
}
