use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use conveyor_domain as domain;

/// 任务提交结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskInput {
    pub name: String,
    pub description: String,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub run: String,
    pub image: String,
    pub registry: Option<RegistryInput>,
    pub env: HashMap<String, String>,
    pub files: HashMap<String, String>,
    pub queue: Option<String>,
    pub pre: Vec<AuxTaskInput>,
    pub post: Vec<AuxTaskInput>,
    pub sidecars: Vec<AuxTaskInput>,
    pub mounts: Vec<MountInput>,
    pub networks: Vec<String>,
    pub retry: Option<RetryInput>,
    pub limits: Option<LimitsInput>,
    pub timeout: Option<String>,
    pub var: Option<String>,
    #[serde(rename = "if")]
    pub if_expr: Option<String>,
    pub parallel: Option<ParallelInput>,
    pub each: Option<EachInput>,
    pub subjob: Option<SubJobInput>,
    pub gpus: Option<String>,
    pub tags: Vec<String>,
    pub workdir: Option<String>,
    pub priority: u8,
}

/// 前置/后置/边车任务：只允许容器规格，不允许结构化形式
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuxTaskInput {
    pub name: String,
    pub description: String,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub run: String,
    pub image: String,
    pub registry: Option<RegistryInput>,
    pub env: HashMap<String, String>,
    pub files: HashMap<String, String>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelInput {
    pub tasks: Vec<TaskInput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EachInput {
    pub var: String,
    pub list: String,
    pub task: Option<Box<TaskInput>>,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubJobInput {
    pub name: String,
    pub description: String,
    pub tasks: Vec<TaskInput>,
    pub inputs: HashMap<String, String>,
    pub output: Option<String>,
    pub detached: bool,
    pub webhooks: Vec<super::job::WebhookInput>,
    #[serde(rename = "autoDelete")]
    pub auto_delete: Option<super::job::AutoDeleteInput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryInput {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountInput {
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryInput {
    pub limit: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsInput {
    pub cpus: String,
    pub memory: String,
}

impl TaskInput {
    /// 转换为领域任务模板（不分配 id，实例化时再分配）
    pub fn to_task(&self) -> domain::Task {
        domain::Task {
            name: self.name.clone(),
            description: self.description.clone(),
            cmd: self.cmd.clone(),
            entrypoint: self.entrypoint.clone(),
            run: self.run.clone(),
            image: self.image.clone(),
            registry: self.registry.as_ref().map(|r| domain::Registry {
                username: r.username.clone(),
                password: r.password.clone(),
            }),
            env: self.env.clone(),
            files: self.files.clone(),
            queue: self.queue.clone(),
            pre: self.pre.iter().map(AuxTaskInput::to_task).collect(),
            post: self.post.iter().map(AuxTaskInput::to_task).collect(),
            sidecars: self.sidecars.iter().map(AuxTaskInput::to_task).collect(),
            mounts: self
                .mounts
                .iter()
                .map(|m| domain::Mount {
                    mount_type: m.mount_type.clone(),
                    source: m.source.clone(),
                    target: m.target.clone(),
                })
                .collect(),
            networks: self.networks.clone(),
            retry: self.retry.as_ref().map(|r| domain::TaskRetry {
                limit: r.limit,
                attempts: 0,
            }),
            limits: self.limits.as_ref().map(|l| domain::TaskLimits {
                cpus: l.cpus.clone(),
                memory: l.memory.clone(),
            }),
            timeout: self.timeout.clone(),
            var: self.var.clone(),
            if_expr: self.if_expr.clone(),
            parallel: self.parallel.as_ref().map(|p| domain::ParallelTask {
                tasks: p.tasks.iter().map(TaskInput::to_task).collect(),
                completions: 0,
            }),
            each: self.each.as_ref().map(|e| domain::EachTask {
                var: e.var.clone(),
                list: e.list.clone(),
                task: e.task.as_ref().map(|t| Box::new(t.to_task())),
                concurrency: e.concurrency,
                size: 0,
                completions: 0,
            }),
            subjob: self.subjob.as_ref().map(|s| domain::SubJobTask {
                name: s.name.clone(),
                description: s.description.clone(),
                tasks: s.tasks.iter().map(TaskInput::to_task).collect(),
                inputs: s.inputs.clone(),
                output: s.output.clone(),
                detached: s.detached,
                webhooks: s.webhooks.iter().map(|w| w.to_webhook()).collect(),
                auto_delete: s.auto_delete.as_ref().map(|a| domain::AutoDelete {
                    after: a.after.clone(),
                }),
            }),
            gpus: self.gpus.clone(),
            tags: self.tags.clone(),
            workdir: self.workdir.clone(),
            priority: self.priority,
            ..domain::Task::default()
        }
    }
}

impl AuxTaskInput {
    pub fn to_task(&self) -> domain::Task {
        domain::Task {
            name: self.name.clone(),
            description: self.description.clone(),
            cmd: self.cmd.clone(),
            entrypoint: self.entrypoint.clone(),
            run: self.run.clone(),
            image: self.image.clone(),
            registry: self.registry.as_ref().map(|r| domain::Registry {
                username: r.username.clone(),
                password: r.password.clone(),
            }),
            env: self.env.clone(),
            files: self.files.clone(),
            timeout: self.timeout.clone(),
            ..domain::Task::default()
        }
    }
}
