use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use conveyor_domain::{
    Broker, Datastore, Job, JobContext, JobState, Task, TaskHandler, TaskState, QUEUE_COMPLETED,
    QUEUE_PENDING,
};
use conveyor_errors::{EngineError, EngineResult};
use conveyor_eval::Evaluator;
use uuid::Uuid;

use crate::scheduler::Scheduler;

/// 已调度任务处理器：结构化展开与叶子派发
///
/// `parallel` 展开为并发子任务；`each` 求值列表后逐元素实例化，
/// 按 `concurrency` 节流释放；`subjob` 创建并提交子作业；叶子
/// 任务按自定义队列或调度器路由。结构化父任务保持 Running，
/// 由完成处理器在子级齐备后推进。
pub struct ScheduledTaskHandler {
    datastore: Arc<dyn Datastore>,
    broker: Arc<dyn Broker>,
    scheduler: Arc<dyn Scheduler>,
    evaluator: Evaluator,
}

impl ScheduledTaskHandler {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        broker: Arc<dyn Broker>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            datastore,
            broker,
            scheduler,
            evaluator: Evaluator::new(),
        }
    }

    async fn mark_running(&self, task_id: &str) -> EngineResult<()> {
        let now = Utc::now();
        self.datastore
            .update_task(
                task_id,
                Box::new(move |u| {
                    if !u.is_terminal() {
                        u.state = TaskState::Running;
                        u.started_at = Some(now);
                    }
                    Ok(())
                }),
            )
            .await
    }

    async fn add_job_tasks(&self, job_id: &str, count: usize) -> EngineResult<()> {
        self.datastore
            .update_job(
                job_id,
                Box::new(move |j| {
                    j.task_count += count;
                    Ok(())
                }),
            )
            .await
    }

    async fn expand_parallel(&self, task: Task) -> EngineResult<()> {
        let Some(parallel) = &task.parallel else {
            return Ok(());
        };
        let now = Utc::now();
        let mut children = Vec::with_capacity(parallel.tasks.len());
        for (index, template) in parallel.tasks.iter().enumerate() {
            let mut child = template.clone();
            child.id = Uuid::new_v4().to_string();
            child.job_id = task.job_id.clone();
            child.parent_id = Some(task.id.clone());
            child.position = index + 1;
            child.state = TaskState::Pending;
            child.created_at = Some(now);
            children.push(self.datastore.create_task(&child).await?);
        }
        self.mark_running(&task.id).await?;
        self.add_job_tasks(&task.job_id, children.len()).await?;
        info!("并行任务 {} 展开为 {} 个子任务", task.id, children.len());
        for child in &children {
            self.broker.publish_task(QUEUE_PENDING, child).await?;
        }
        Ok(())
    }

    async fn expand_each(&self, task: Task) -> EngineResult<()> {
        let Some(each) = task.each.clone() else {
            return Ok(());
        };
        let job = self.datastore.get_job_by_id(&task.job_id).await?;
        let items = self.evaluator.eval_list(&each.list, &job.context)?;
        let total = items.len();
        let now = Utc::now();

        self.datastore
            .update_task(
                &task.id,
                Box::new(move |u| {
                    if u.is_terminal() {
                        return Ok(());
                    }
                    u.state = TaskState::Running;
                    u.started_at = Some(now);
                    if let Some(e) = &mut u.each {
                        e.size = total;
                    }
                    Ok(())
                }),
            )
            .await?;

        if items.is_empty() {
            // 空列表：父任务立即完成，完成计数为零
            info!("each 任务 {} 的列表为空，直接完成", task.id);
            let parent = self.datastore.get_task_by_id(&task.id).await?;
            self.broker.publish_task(QUEUE_COMPLETED, &parent).await?;
            return Ok(());
        }

        let template = each.task.as_deref().ok_or_else(|| {
            EngineError::validation(format!("each 任务 {} 缺少子任务模板", task.id))
        })?;
        let var = if each.var.is_empty() {
            "item".to_string()
        } else {
            each.var.clone()
        };

        let mut released = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let mut child = template.clone();
            child.id = Uuid::new_v4().to_string();
            child.job_id = task.job_id.clone();
            child.parent_id = Some(task.id.clone());
            child.position = index + 1;
            child.created_at = Some(now);

            let mut extra = HashMap::new();
            extra.insert(var.clone(), item.clone());
            extra.insert("index".to_string(), serde_json::json!(index));
            self.evaluator
                .evaluate_task_with(&mut child, &job.context, &extra)?;

            // 节流：只释放前 concurrency 个，其余保持 Created 排队
            let release = each.concurrency == 0 || index < each.concurrency;
            child.state = if release {
                TaskState::Pending
            } else {
                TaskState::Created
            };
            let created = self.datastore.create_task(&child).await?;
            if release {
                released.push(created);
            }
        }

        self.add_job_tasks(&task.job_id, total).await?;
        info!(
            "each 任务 {} 展开为 {} 个子任务，先释放 {} 个",
            task.id,
            total,
            released.len()
        );
        for child in &released {
            self.broker.publish_task(QUEUE_PENDING, child).await?;
        }
        Ok(())
    }

    async fn expand_subjob(&self, task: Task) -> EngineResult<()> {
        let Some(subjob) = task.subjob.clone() else {
            return Ok(());
        };
        let parent_job = self.datastore.get_job_by_id(&task.job_id).await?;
        let sub = Job {
            id: Uuid::new_v4().to_string(),
            name: subjob.name.clone(),
            description: subjob.description.clone(),
            state: JobState::Pending,
            tasks: subjob.tasks.clone(),
            inputs: subjob.inputs.clone(),
            context: JobContext {
                inputs: subjob.inputs.clone(),
                ..JobContext::default()
            },
            parent_id: Some(task.id.clone()),
            output: subjob.output.clone(),
            detached: subjob.detached,
            webhooks: subjob.webhooks.clone(),
            auto_delete: subjob.auto_delete.clone(),
            created_by: parent_job.created_by.clone(),
            created_at: Utc::now(),
            ..Job::default()
        };
        let sub = self.datastore.create_job(&sub).await?;
        self.mark_running(&task.id).await?;
        info!("任务 {} 提交子作业 {}", task.id, sub.id);
        self.broker.publish_job(&sub).await?;

        if subjob.detached {
            // 分离模式：提交即完成父任务
            let parent = self.datastore.get_task_by_id(&task.id).await?;
            self.broker.publish_task(QUEUE_COMPLETED, &parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for ScheduledTaskHandler {
    async fn handle(&self, task: Task) -> EngineResult<()> {
        let task = self.datastore.get_task_by_id(&task.id).await?;
        if task.is_terminal() {
            debug!("任务 {} 已处于终态，忽略派发事件", task.id);
            return Ok(());
        }
        // 结构化任务重放防护：Running 表示已展开
        if task.is_structural() && task.state == TaskState::Running {
            debug!("结构化任务 {} 已展开，忽略重复派发", task.id);
            return Ok(());
        }

        if task.parallel.is_some() {
            self.expand_parallel(task).await
        } else if task.each.is_some() {
            self.expand_each(task).await
        } else if task.subjob.is_some() {
            self.expand_subjob(task).await
        } else if let Some(queue) = task.queue.clone().filter(|q| !q.is_empty()) {
            debug!("任务 {} 发布到自定义队列 {}", task.id, queue);
            self.broker.publish_task(&queue, &task).await
        } else {
            self.scheduler.schedule(task).await
        }
    }
}
