use std::sync::Arc;

use async_trait::async_trait;

use conveyor_domain::{Datastore, LogHandler, TaskLogPart};
use conveyor_errors::EngineResult;

/// 日志分片落盘处理器
pub struct LogPartHandler {
    datastore: Arc<dyn Datastore>,
}

impl LogPartHandler {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }
}

#[async_trait]
impl LogHandler for LogPartHandler {
    async fn handle(&self, part: TaskLogPart) -> EngineResult<()> {
        self.datastore.create_task_log_part(&part).await.map(|_| ())
    }
}
