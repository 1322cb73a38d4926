use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use conveyor_domain::{node_queue, Broker, Datastore, Node, NodeStatus, Task};
use conveyor_errors::{EngineError, EngineResult};

/// 任务调度器：把已调度的叶子任务路由到具体节点队列
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule(&self, task: Task) -> EngineResult<()>;
}

/// 朴素调度器
///
/// 候选节点的心跳须在两个心跳周期内；GPU 任务只路由到 GPU 节点；
/// 取当前任务数最少者，并列时按节点 ID 字典序取最小。无可用节点
/// 时返回 Unavailable，由消息队列退避后重新投递。
pub struct NaiveScheduler {
    datastore: Arc<dyn Datastore>,
    broker: Arc<dyn Broker>,
    heartbeat_interval: Duration,
}

impl NaiveScheduler {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        broker: Arc<dyn Broker>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            datastore,
            broker,
            heartbeat_interval,
        }
    }

    fn eligible(&self, nodes: Vec<Node>, task: &Task) -> Vec<Node> {
        let window = chrono::Duration::from_std(self.heartbeat_interval * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let needs_gpu = task.gpus.as_deref().map_or(false, |g| !g.is_empty());
        nodes
            .into_iter()
            .filter(|n| n.status == NodeStatus::Up)
            .filter(|n| n.heartbeat_within(window))
            .filter(|n| n.has_capacity())
            .filter(|n| !needs_gpu || n.gpu)
            .collect()
    }
}

#[async_trait]
impl Scheduler for NaiveScheduler {
    async fn schedule(&self, task: Task) -> EngineResult<()> {
        let nodes = self.datastore.get_active_nodes().await?;
        let mut eligible = self.eligible(nodes, &task);
        eligible.sort_by(|a, b| a.task_count.cmp(&b.task_count).then(a.id.cmp(&b.id)));

        let Some(node) = eligible.first() else {
            return Err(EngineError::unavailable(format!(
                "任务 {} 暂无可用节点",
                task.id
            )));
        };
        debug!(
            "任务 {} 调度到节点 {}（当前负载 {}）",
            task.id, node.id, node.task_count
        );
        self.broker
            .publish_task(&node_queue(&node.id), &task)
            .await
    }
}
