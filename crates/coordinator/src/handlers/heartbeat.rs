use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use conveyor_domain::{Datastore, Node, NodeHandler};
use conveyor_errors::EngineResult;

/// 节点心跳处理器
///
/// 首次心跳注册节点，此后刷新心跳时间与负载。
pub struct HeartbeatHandler {
    datastore: Arc<dyn Datastore>,
}

impl HeartbeatHandler {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }
}

#[async_trait]
impl NodeHandler for HeartbeatHandler {
    async fn handle(&self, node: Node) -> EngineResult<()> {
        let node_id = node.id.clone();
        match self.datastore.get_node_by_id(&node_id).await {
            Ok(_) => {
                debug!("刷新节点 {} 的心跳", node_id);
                self.datastore
                    .update_node(
                        &node_id,
                        Box::new(move |u| {
                            u.last_heartbeat_at = node.last_heartbeat_at;
                            u.task_count = node.task_count;
                            u.capacity = node.capacity;
                            u.gpu = node.gpu;
                            u.status = node.status;
                            u.hostname = node.hostname;
                            Ok(())
                        }),
                    )
                    .await
            }
            Err(e) if e.is_not_found() => {
                info!("注册新节点 {} ({})", node_id, node.hostname);
                self.datastore.create_node(&node).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }
}
