use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use conveyor_domain::{
    node_queue, Broker, Node, NodeStatus, Task, TaskHandler, TaskLogPart, TaskState,
    QUEUE_COMPLETED, QUEUE_ERROR, QUEUE_STARTED,
};
use conveyor_errors::{EngineError, EngineResult};
use conveyor_runtime::TaskRuntime;

/// 工作节点配置
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// 节点 ID，缺省时自动生成
    pub id: Option<String>,
    /// 心跳间隔
    pub heartbeat_interval: Duration,
    /// 额外订阅的自定义队列
    pub queues: Vec<String>,
    /// 并发任务上限，0 表示不限制
    pub capacity: usize,
    /// 节点是否具备 GPU 能力
    pub gpu: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: None,
            heartbeat_interval: Duration::from_secs(30),
            queues: Vec::new(),
            capacity: 0,
            gpu: false,
        }
    }
}

/// 工作节点服务
///
/// 启动后订阅 `node.<id>` 队列与配置的自定义队列。每个任务：
/// 上报 Started、经运行时执行（前置、主体、后置依次进行）、流式
/// 推送日志分片、上报 Completed 或 Error。
pub struct Worker {
    id: String,
    hostname: String,
    broker: Arc<dyn Broker>,
    runtime: Arc<dyn TaskRuntime>,
    config: WorkerConfig,
    task_count: Arc<AtomicUsize>,
    started_at: DateTime<Utc>,
    shutdown: Arc<AtomicBool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(broker: Arc<dyn Broker>, runtime: Arc<dyn TaskRuntime>) -> Self {
        Self::with_config(broker, runtime, WorkerConfig::default())
    }

    pub fn with_config(
        broker: Arc<dyn Broker>,
        runtime: Arc<dyn TaskRuntime>,
        config: WorkerConfig,
    ) -> Self {
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            id,
            hostname,
            broker,
            runtime,
            config,
            task_count: Arc::new(AtomicUsize::new(0)),
            started_at: Utc::now(),
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 当前节点状态快照
    fn snapshot(&self) -> Node {
        Node {
            id: self.id.clone(),
            hostname: self.hostname.clone(),
            last_heartbeat_at: Utc::now(),
            task_count: self.task_count.load(Ordering::Relaxed),
            capacity: self.config.capacity,
            gpu: self.config.gpu,
            status: NodeStatus::Up,
            started_at: Some(self.started_at),
        }
    }

    pub async fn start(&self) -> EngineResult<()> {
        info!("启动工作节点 {} ({})", self.id, self.hostname);

        // 首次心跳立即注册节点
        self.broker.publish_heartbeat(&self.snapshot()).await?;

        let handler = Arc::new(NodeTaskHandler {
            node_id: self.id.clone(),
            broker: self.broker.clone(),
            runtime: self.runtime.clone(),
            task_count: self.task_count.clone(),
        });
        self.broker
            .subscribe_for_tasks(&node_queue(&self.id), handler.clone())
            .await?;
        for queue in &self.config.queues {
            info!("工作节点 {} 订阅自定义队列 {}", self.id, queue);
            self.broker
                .subscribe_for_tasks(queue, handler.clone())
                .await?;
        }

        // 心跳循环
        let broker = self.broker.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.config.heartbeat_interval;
        let heartbeat_source = HeartbeatSource {
            id: self.id.clone(),
            hostname: self.hostname.clone(),
            capacity: self.config.capacity,
            gpu: self.config.gpu,
            started_at: self.started_at,
            task_count: self.task_count.clone(),
        };
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = broker.publish_heartbeat(&heartbeat_source.snapshot()).await {
                    error!("发送心跳失败: {}", e);
                }
            }
        });
        if let Ok(mut handles) = self.handles.lock() {
            handles.push(handle);
        }

        Ok(())
    }

    pub async fn stop(&self) -> EngineResult<()> {
        info!("停止工作节点 {}", self.id);
        self.shutdown.store(true, Ordering::Relaxed);
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
        Ok(())
    }
}

struct HeartbeatSource {
    id: String,
    hostname: String,
    capacity: usize,
    gpu: bool,
    started_at: DateTime<Utc>,
    task_count: Arc<AtomicUsize>,
}

impl HeartbeatSource {
    fn snapshot(&self) -> Node {
        Node {
            id: self.id.clone(),
            hostname: self.hostname.clone(),
            last_heartbeat_at: Utc::now(),
            task_count: self.task_count.load(Ordering::Relaxed),
            capacity: self.capacity,
            gpu: self.gpu,
            status: NodeStatus::Up,
            started_at: Some(self.started_at),
        }
    }
}

/// 节点队列的任务处理器
struct NodeTaskHandler {
    node_id: String,
    broker: Arc<dyn Broker>,
    runtime: Arc<dyn TaskRuntime>,
    task_count: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for NodeTaskHandler {
    async fn handle(&self, task: Task) -> EngineResult<()> {
        match task.state {
            TaskState::Scheduled => {
                // 执行放到独立任务，处理循环继续接收取消消息
                let executor = ExecutionContext {
                    node_id: self.node_id.clone(),
                    broker: self.broker.clone(),
                    runtime: self.runtime.clone(),
                    task_count: self.task_count.clone(),
                };
                tokio::spawn(async move {
                    executor.execute(task).await;
                });
                Ok(())
            }
            TaskState::Cancelled => {
                info!("收到任务 {} 的取消指令", task.id);
                self.runtime.stop(&task).await
            }
            other => {
                warn!("忽略状态为 {:?} 的任务 {}", other, task.id);
                Ok(())
            }
        }
    }
}

struct ExecutionContext {
    node_id: String,
    broker: Arc<dyn Broker>,
    runtime: Arc<dyn TaskRuntime>,
    task_count: Arc<AtomicUsize>,
}

impl ExecutionContext {
    async fn execute(&self, mut task: Task) {
        self.task_count.fetch_add(1, Ordering::Relaxed);
        self.run_reporting(&mut task).await;
        self.task_count.fetch_sub(1, Ordering::Relaxed);
    }

    async fn run_reporting(&self, task: &mut Task) {
        let now = Utc::now();
        task.state = TaskState::Running;
        task.started_at = Some(now);
        task.node_id = Some(self.node_id.clone());
        if let Err(e) = self.broker.publish_task(QUEUE_STARTED, task).await {
            error!("上报任务 {} 开始执行失败: {}", task.id, e);
            return;
        }

        // 日志分片转发
        let (log_tx, mut log_rx) = mpsc::unbounded_channel::<String>();
        let log_broker = self.broker.clone();
        let log_task_id = task.id.clone();
        let forwarder = tokio::spawn(async move {
            let number = AtomicU32::new(1);
            while let Some(line) = log_rx.recv().await {
                let part = TaskLogPart {
                    task_id: log_task_id.clone(),
                    number: number.fetch_add(1, Ordering::Relaxed),
                    contents: line,
                    created_at: None,
                };
                if let Err(e) = log_broker.publish_log_part(&part).await {
                    debug!("发布日志分片失败: {}", e);
                }
            }
        });

        // 前置任务按顺序执行，任一失败即终止
        let pre_tasks = task.pre.clone();
        for (index, pre) in pre_tasks.into_iter().enumerate() {
            let mut pre_task = pre;
            pre_task.id = format!("{}-pre{}", task.id, index + 1);
            pre_task.job_id = task.job_id.clone();
            if let Err(e) = self.runtime.run(&pre_task, log_tx.clone()).await {
                warn!("任务 {} 的前置任务 {} 失败: {}", task.id, pre_task.name, e);
                drop(log_tx);
                let _ = forwarder.await;
                self.report_error(task, e).await;
                return;
            }
        }

        // 边车随主任务启动，主任务结束后统一回收
        let mut sidecars = Vec::new();
        for (index, sidecar) in task.sidecars.clone().into_iter().enumerate() {
            let mut sidecar_task = sidecar;
            sidecar_task.id = format!("{}-sidecar{}", task.id, index + 1);
            sidecar_task.job_id = task.job_id.clone();
            let runtime = self.runtime.clone();
            let sidecar_logs = log_tx.clone();
            let running = sidecar_task.clone();
            tokio::spawn(async move {
                if let Err(e) = runtime.run(&running, sidecar_logs).await {
                    debug!("边车 {} 退出: {}", running.id, e);
                }
            });
            sidecars.push(sidecar_task);
        }

        let result = self.runtime.run(task, log_tx.clone()).await;

        for sidecar in &sidecars {
            if let Err(e) = self.runtime.stop(sidecar).await {
                debug!("回收边车 {} 失败: {}", sidecar.id, e);
            }
        }

        match result {
            Ok(output) => {
                // 后置任务失败同样使主任务失败
                let post_tasks = task.post.clone();
                for (index, post) in post_tasks.into_iter().enumerate() {
                    let mut post_task = post;
                    post_task.id = format!("{}-post{}", task.id, index + 1);
                    post_task.job_id = task.job_id.clone();
                    if let Err(e) = self.runtime.run(&post_task, log_tx.clone()).await {
                        warn!(
                            "任务 {} 的后置任务 {} 失败: {}",
                            task.id, post_task.name, e
                        );
                        drop(log_tx);
                        let _ = forwarder.await;
                        self.report_error(task, e).await;
                        return;
                    }
                }
                drop(log_tx);
                let _ = forwarder.await;
                task.state = TaskState::Completed;
                task.completed_at = Some(Utc::now());
                task.result = Some(output);
                if let Err(e) = self.broker.publish_task(QUEUE_COMPLETED, task).await {
                    error!("上报任务 {} 完成失败: {}", task.id, e);
                }
            }
            Err(EngineError::Cancelled) => {
                drop(log_tx);
                let _ = forwarder.await;
                // 取消由协调器登记终态，这里不再上报
                info!("任务 {} 已取消", task.id);
            }
            Err(e) => {
                drop(log_tx);
                let _ = forwarder.await;
                self.report_error(task, e).await;
            }
        }
    }

    async fn report_error(&self, task: &mut Task, err: EngineError) {
        warn!("任务 {} 执行失败: {}", task.id, err);
        task.state = TaskState::Failed;
        task.failed_at = Some(Utc::now());
        task.error = Some(err.to_string());
        if let Err(e) = self.broker.publish_task(QUEUE_ERROR, task).await {
            error!("上报任务 {} 失败状态时出错: {}", task.id, e);
        }
    }
}
