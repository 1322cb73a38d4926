use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use conveyor_domain::{
    Broker, Job, JobHandler, LogHandler, Node, NodeHandler, QueueInfo, Task, TaskHandler,
    TaskLogPart, QUEUE_ERROR, QUEUE_HEARTBEAT, QUEUE_JOBS, QUEUE_LOGS,
};
use conveyor_errors::{EngineError, EngineResult};

/// 内存消息队列配置
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// 单条消息的最大投递次数，超过后进入死信
    pub max_delivery_attempts: u32,
    /// 投递失败后的重入队退避
    pub redelivery_backoff: Duration,
    /// 消费轮询间隔
    pub poll_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 3,
            redelivery_backoff: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// 消息信封，跟踪每条消息的投递次数
#[derive(Debug, Clone)]
struct Envelope<T> {
    payload: T,
    attempts: u32,
}

struct Channel<T> {
    tx: mpsc::UnboundedSender<Envelope<T>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Envelope<T>>>>,
    size: Arc<AtomicUsize>,
    subscribers: Arc<AtomicUsize>,
}

impl<T> Channel<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            size: Arc::new(AtomicUsize::new(0)),
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn send(&self, envelope: Envelope<T>) -> EngineResult<()> {
        self.tx
            .send(envelope)
            .map_err(|e| EngineError::broker(format!("failed to enqueue message: {e}")))?;
        self.size.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            size: self.size.clone(),
            subscribers: self.subscribers.clone(),
        }
    }
}

/// 内存消息队列实现
///
/// 使用 tokio channels 实现的命名队列，按载荷类型分平面：任务队列
/// 按名字动态创建，作业/心跳/日志为固定队列。订阅者以竞争消费方式
/// 轮询共享接收端；处理失败的消息带退避重新入队，超过投递上限的
/// 任务载荷转入 `error` 死信队列。
pub struct InMemoryBroker {
    task_queues: Arc<RwLock<HashMap<String, Channel<Task>>>>,
    jobs: Channel<Job>,
    heartbeats: Channel<Node>,
    logs: Channel<TaskLogPart>,
    config: BrokerConfig,
    shutdown: Arc<AtomicBool>,
    handles: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        info!("Creating in-memory broker with config: {:?}", config);
        Self {
            task_queues: Arc::new(RwLock::new(HashMap::new())),
            jobs: Channel::new(),
            heartbeats: Channel::new(),
            logs: Channel::new(),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    async fn task_channel(&self, queue: &str) -> Channel<Task> {
        {
            let queues = self.task_queues.read().await;
            if let Some(channel) = queues.get(queue) {
                return channel.clone();
            }
        }
        let mut queues = self.task_queues.write().await;
        queues
            .entry(queue.to_string())
            .or_insert_with(|| {
                debug!("Creating queue '{}'", queue);
                Channel::new()
            })
            .clone()
    }

    /// 为一个订阅启动竞争消费循环
    fn spawn_consumer<T, H, F>(
        &self,
        queue_name: String,
        channel: Channel<T>,
        handler: Arc<H>,
        dead_letter: F,
    ) where
        T: Clone + Send + 'static,
        H: ?Sized + Send + Sync + 'static,
        F: Fn(&InMemoryBroker, Envelope<T>) + Send + 'static,
        Arc<H>: HandlerDispatch<T>,
    {
        channel.subscribers.fetch_add(1, Ordering::Relaxed);
        let shutdown = self.shutdown.clone();
        let config = self.config.clone();
        let broker = self.shallow_clone();
        let handle = tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let next = {
                    let mut rx = channel.rx.lock().await;
                    rx.try_recv().ok()
                };
                let Some(envelope) = next else {
                    tokio::time::sleep(config.poll_interval).await;
                    continue;
                };
                channel.size.fetch_sub(1, Ordering::Relaxed);
                let attempts = envelope.attempts + 1;
                if let Err(e) = handler.dispatch(envelope.payload.clone()).await {
                    if e.is_retryable() && attempts < config.max_delivery_attempts {
                        warn!(
                            "Handler for '{}' failed (attempt {}/{}), requeueing: {}",
                            queue_name, attempts, config.max_delivery_attempts, e
                        );
                        tokio::time::sleep(config.redelivery_backoff).await;
                        let _ = channel.send(Envelope {
                            payload: envelope.payload,
                            attempts,
                        });
                    } else {
                        error!(
                            "Handler for '{}' failed terminally after {} attempt(s): {}",
                            queue_name, attempts, e
                        );
                        dead_letter(
                            &broker,
                            Envelope {
                                payload: envelope.payload,
                                attempts,
                            },
                        );
                    }
                }
            }
        });
        if let Ok(mut handles) = self.handles.lock() {
            handles.push(handle);
        }
    }

    /// 共享内部状态的轻量副本，供消费循环做死信投递
    fn shallow_clone(&self) -> InMemoryBroker {
        InMemoryBroker {
            task_queues: self.task_queues.clone(),
            jobs: self.jobs.clone(),
            heartbeats: self.heartbeats.clone(),
            logs: self.logs.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            handles: self.handles.clone(),
        }
    }

    fn dead_letter_task(&self, queue: &str, envelope: Envelope<Task>) {
        if queue == QUEUE_ERROR {
            error!(
                "Dropping task {} from dead-letter queue after {} attempts",
                envelope.payload.id, envelope.attempts
            );
            return;
        }
        let task_queues = self.task_queues.clone();
        let payload = envelope.payload;
        tokio::spawn(async move {
            let channel = {
                let queues = task_queues.read().await;
                queues.get(QUEUE_ERROR).cloned()
            };
            let channel = match channel {
                Some(channel) => channel,
                None => {
                    let mut queues = task_queues.write().await;
                    queues
                        .entry(QUEUE_ERROR.to_string())
                        .or_insert_with(Channel::new)
                        .clone()
                }
            };
            warn!("Dead-lettering task {} to '{}'", payload.id, QUEUE_ERROR);
            let _ = channel.send(Envelope {
                payload,
                attempts: 0,
            });
        });
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// 统一处理器调用接口，供消费循环按载荷类型分发
#[async_trait]
pub trait HandlerDispatch<T>: Send + Sync {
    async fn dispatch(&self, payload: T) -> EngineResult<()>;
}

#[async_trait]
impl HandlerDispatch<Task> for Arc<dyn TaskHandler> {
    async fn dispatch(&self, payload: Task) -> EngineResult<()> {
        self.handle(payload).await
    }
}

#[async_trait]
impl HandlerDispatch<Job> for Arc<dyn JobHandler> {
    async fn dispatch(&self, payload: Job) -> EngineResult<()> {
        self.handle(payload).await
    }
}

#[async_trait]
impl HandlerDispatch<Node> for Arc<dyn NodeHandler> {
    async fn dispatch(&self, payload: Node) -> EngineResult<()> {
        self.handle(payload).await
    }
}

#[async_trait]
impl HandlerDispatch<TaskLogPart> for Arc<dyn LogHandler> {
    async fn dispatch(&self, payload: TaskLogPart) -> EngineResult<()> {
        self.handle(payload).await
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish_task(&self, queue: &str, task: &Task) -> EngineResult<()> {
        debug!("Publishing task {} to '{}'", task.id, queue);
        let channel = self.task_channel(queue).await;
        channel.send(Envelope {
            payload: task.clone(),
            attempts: 0,
        })
    }

    async fn subscribe_for_tasks(
        &self,
        queue: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> EngineResult<()> {
        let channel = self.task_channel(queue).await;
        let queue_owned = queue.to_string();
        let dead_letter_queue = queue.to_string();
        self.spawn_consumer(
            queue_owned,
            channel,
            handler,
            move |broker, envelope: Envelope<Task>| {
                broker.dead_letter_task(&dead_letter_queue, envelope);
            },
        );
        Ok(())
    }

    async fn publish_job(&self, job: &Job) -> EngineResult<()> {
        debug!("Publishing job {} ({:?})", job.id, job.state);
        self.jobs.send(Envelope {
            payload: job.clone(),
            attempts: 0,
        })
    }

    async fn subscribe_for_jobs(&self, handler: Arc<dyn JobHandler>) -> EngineResult<()> {
        self.spawn_consumer(
            QUEUE_JOBS.to_string(),
            self.jobs.clone(),
            handler,
            |_, envelope: Envelope<Job>| {
                error!(
                    "Dropping job message {} after {} attempts",
                    envelope.payload.id, envelope.attempts
                );
            },
        );
        Ok(())
    }

    async fn publish_heartbeat(&self, node: &Node) -> EngineResult<()> {
        self.heartbeats.send(Envelope {
            payload: node.clone(),
            attempts: 0,
        })
    }

    async fn subscribe_for_heartbeats(&self, handler: Arc<dyn NodeHandler>) -> EngineResult<()> {
        self.spawn_consumer(
            QUEUE_HEARTBEAT.to_string(),
            self.heartbeats.clone(),
            handler,
            |_, envelope: Envelope<Node>| {
                warn!(
                    "Dropping heartbeat from node {} after {} attempts",
                    envelope.payload.id, envelope.attempts
                );
            },
        );
        Ok(())
    }

    async fn publish_log_part(&self, part: &TaskLogPart) -> EngineResult<()> {
        self.logs.send(Envelope {
            payload: part.clone(),
            attempts: 0,
        })
    }

    async fn subscribe_for_logs(&self, handler: Arc<dyn LogHandler>) -> EngineResult<()> {
        self.spawn_consumer(
            QUEUE_LOGS.to_string(),
            self.logs.clone(),
            handler,
            |_, envelope: Envelope<TaskLogPart>| {
                warn!(
                    "Dropping log part {} of task {} after {} attempts",
                    envelope.payload.number, envelope.payload.task_id, envelope.attempts
                );
            },
        );
        Ok(())
    }

    async fn queues(&self) -> EngineResult<Vec<QueueInfo>> {
        let mut infos = Vec::new();
        {
            let queues = self.task_queues.read().await;
            for (name, channel) in queues.iter() {
                infos.push(QueueInfo {
                    name: name.clone(),
                    size: channel.size.load(Ordering::Relaxed),
                    subscribers: channel.subscribers.load(Ordering::Relaxed),
                });
            }
        }
        infos.push(QueueInfo {
            name: QUEUE_JOBS.to_string(),
            size: self.jobs.size.load(Ordering::Relaxed),
            subscribers: self.jobs.subscribers.load(Ordering::Relaxed),
        });
        infos.push(QueueInfo {
            name: QUEUE_HEARTBEAT.to_string(),
            size: self.heartbeats.size.load(Ordering::Relaxed),
            subscribers: self.heartbeats.subscribers.load(Ordering::Relaxed),
        });
        infos.push(QueueInfo {
            name: QUEUE_LOGS.to_string(),
            size: self.logs.size.load(Ordering::Relaxed),
            subscribers: self.logs.subscribers.load(Ordering::Relaxed),
        });
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn shutdown(&self) -> EngineResult<()> {
        info!("Shutting down in-memory broker");
        self.shutdown.store(true, Ordering::Relaxed);
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
        Ok(())
    }
}
