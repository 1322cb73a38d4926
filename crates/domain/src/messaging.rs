//! 消息队列端口
//!
//! 命名队列按载荷类型划分；保留队列构成调度平面，`node.<id>` 为
//! 节点派发队列，其余非保留名称为用户自定义队列。

use std::sync::Arc;

use async_trait::async_trait;
use conveyor_errors::EngineResult;
use serde::{Deserialize, Serialize};

use crate::models::{Job, Node, Task, TaskLogPart};

/// 待调度任务队列（挂起处理器消费）
pub const QUEUE_PENDING: &str = "pending";
/// 默认派发队列（已调度处理器消费，做结构展开与节点路由）
pub const QUEUE_DEFAULT: &str = "default";
/// 任务开始执行上报队列
pub const QUEUE_STARTED: &str = "started";
/// 任务完成上报队列
pub const QUEUE_COMPLETED: &str = "completed";
/// 任务失败上报与死信队列
pub const QUEUE_ERROR: &str = "error";
/// 节点心跳队列
pub const QUEUE_HEARTBEAT: &str = "heartbeat";
/// 作业生命周期事件队列
pub const QUEUE_JOBS: &str = "jobs";
/// 任务日志分片队列
pub const QUEUE_LOGS: &str = "logs";

/// 节点派发队列前缀
pub const NODE_QUEUE_PREFIX: &str = "node.";

/// 节点 ID 对应的派发队列名
pub fn node_queue(node_id: &str) -> String {
    format!("{NODE_QUEUE_PREFIX}{node_id}")
}

/// 队列名是否为引擎保留（大小写不敏感）
pub fn is_reserved_queue(name: &str) -> bool {
    let lower = name.to_lowercase();
    matches!(
        lower.as_str(),
        QUEUE_PENDING
            | QUEUE_DEFAULT
            | QUEUE_STARTED
            | QUEUE_COMPLETED
            | QUEUE_ERROR
            | QUEUE_HEARTBEAT
            | QUEUE_JOBS
            | QUEUE_LOGS
    ) || lower.starts_with(NODE_QUEUE_PREFIX)
}

/// 队列自省信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub size: usize,
    pub subscribers: usize,
}

/// 任务消息处理器
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> EngineResult<()>;
}

/// 作业消息处理器
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> EngineResult<()>;
}

/// 节点心跳处理器
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn handle(&self, node: Node) -> EngineResult<()>;
}

/// 日志分片处理器
#[async_trait]
pub trait LogHandler: Send + Sync {
    async fn handle(&self, part: TaskLogPart) -> EngineResult<()>;
}

/// 消息队列抽象接口
///
/// 投递语义为至少一次：订阅按到达顺序串行回调，多个订阅者构成
/// 竞争消费。处理器返回错误时消息按上限重新入队，超限后任务类
/// 载荷转入死信队列。
#[async_trait]
pub trait Broker: Send + Sync {
    /// 发布任务消息到指定队列
    async fn publish_task(&self, queue: &str, task: &Task) -> EngineResult<()>;

    /// 订阅指定队列的任务消息
    async fn subscribe_for_tasks(
        &self,
        queue: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> EngineResult<()>;

    /// 发布作业生命周期事件
    async fn publish_job(&self, job: &Job) -> EngineResult<()>;

    /// 订阅作业生命周期事件
    async fn subscribe_for_jobs(&self, handler: Arc<dyn JobHandler>) -> EngineResult<()>;

    /// 发布节点心跳
    async fn publish_heartbeat(&self, node: &Node) -> EngineResult<()>;

    /// 订阅节点心跳
    async fn subscribe_for_heartbeats(&self, handler: Arc<dyn NodeHandler>) -> EngineResult<()>;

    /// 发布任务日志分片
    async fn publish_log_part(&self, part: &TaskLogPart) -> EngineResult<()>;

    /// 订阅任务日志分片
    async fn subscribe_for_logs(&self, handler: Arc<dyn LogHandler>) -> EngineResult<()>;

    /// 列出所有队列及其大小、订阅者数量
    async fn queues(&self) -> EngineResult<Vec<QueueInfo>>;

    /// 停止所有投递循环
    async fn shutdown(&self) -> EngineResult<()>;
}
