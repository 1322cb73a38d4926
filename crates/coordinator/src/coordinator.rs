use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use conveyor_domain::{
    Broker, Datastore, QUEUE_COMPLETED, QUEUE_DEFAULT, QUEUE_ERROR, QUEUE_PENDING, QUEUE_STARTED,
};
use conveyor_errors::EngineResult;

use crate::handlers::{
    CompletedTaskHandler, FailedTaskHandler, HeartbeatHandler, JobLifecycleHandler,
    LogPartHandler, PendingTaskHandler, ScheduledTaskHandler, StartedTaskHandler,
};
use crate::scheduler::{NaiveScheduler, Scheduler};

/// 协调器配置
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// 节点心跳间隔，调度器据此判断节点新鲜度
    pub heartbeat_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// 协调器
///
/// 启动时把每个状态处理器绑定到对应的保留队列。队列订阅表即
/// (实体 × 事件) -> 处理器的分发表。
pub struct Coordinator {
    datastore: Arc<dyn Datastore>,
    broker: Arc<dyn Broker>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(datastore: Arc<dyn Datastore>, broker: Arc<dyn Broker>) -> Self {
        Self::with_config(datastore, broker, CoordinatorConfig::default())
    }

    pub fn with_config(
        datastore: Arc<dyn Datastore>,
        broker: Arc<dyn Broker>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            datastore,
            broker,
            config,
        }
    }

    pub async fn start(&self) -> EngineResult<()> {
        info!("启动协调器");
        let datastore = &self.datastore;
        let broker = &self.broker;
        let scheduler: Arc<dyn Scheduler> = Arc::new(NaiveScheduler::new(
            datastore.clone(),
            broker.clone(),
            self.config.heartbeat_interval,
        ));

        broker
            .subscribe_for_tasks(
                QUEUE_PENDING,
                Arc::new(PendingTaskHandler::new(datastore.clone(), broker.clone())),
            )
            .await?;
        broker
            .subscribe_for_tasks(
                QUEUE_DEFAULT,
                Arc::new(ScheduledTaskHandler::new(
                    datastore.clone(),
                    broker.clone(),
                    scheduler,
                )),
            )
            .await?;
        broker
            .subscribe_for_tasks(
                QUEUE_STARTED,
                Arc::new(StartedTaskHandler::new(datastore.clone(), broker.clone())),
            )
            .await?;
        broker
            .subscribe_for_tasks(
                QUEUE_COMPLETED,
                Arc::new(CompletedTaskHandler::new(datastore.clone(), broker.clone())),
            )
            .await?;
        broker
            .subscribe_for_tasks(
                QUEUE_ERROR,
                Arc::new(FailedTaskHandler::new(datastore.clone(), broker.clone())),
            )
            .await?;
        broker
            .subscribe_for_heartbeats(Arc::new(HeartbeatHandler::new(datastore.clone())))
            .await?;
        broker
            .subscribe_for_jobs(Arc::new(JobLifecycleHandler::new(
                datastore.clone(),
                broker.clone(),
            )))
            .await?;
        broker
            .subscribe_for_logs(Arc::new(LogPartHandler::new(datastore.clone())))
            .await?;

        info!("协调器就绪");
        Ok(())
    }
}
