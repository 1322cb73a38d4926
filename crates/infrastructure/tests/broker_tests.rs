use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conveyor_domain::{
    Broker, Job, Node, Task, TaskHandler, TaskLogPart, JobHandler, LogHandler, NodeHandler,
    QUEUE_ERROR,
};
use conveyor_errors::{EngineError, EngineResult};
use conveyor_infrastructure::{BrokerConfig, InMemoryBroker};
use conveyor_testing_utils::{wait_until, TaskBuilder};

struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskHandler for Recorder {
    async fn handle(&self, task: Task) -> EngineResult<()> {
        self.seen.lock().unwrap().push(task.id);
        Ok(())
    }
}

#[async_trait]
impl JobHandler for Recorder {
    async fn handle(&self, job: Job) -> EngineResult<()> {
        self.seen.lock().unwrap().push(job.id);
        Ok(())
    }
}

#[async_trait]
impl NodeHandler for Recorder {
    async fn handle(&self, node: Node) -> EngineResult<()> {
        self.seen.lock().unwrap().push(node.id);
        Ok(())
    }
}

#[async_trait]
impl LogHandler for Recorder {
    async fn handle(&self, part: TaskLogPart) -> EngineResult<()> {
        self.seen.lock().unwrap().push(part.contents);
        Ok(())
    }
}

/// 前 N 次投递失败的处理器
struct FlakyHandler {
    failures: usize,
    attempts: AtomicUsize,
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn handle(&self, _task: Task) -> EngineResult<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            Err(EngineError::broker("transient failure"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_publish_and_subscribe_tasks() {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::new();
    broker
        .subscribe_for_tasks("test-queue", recorder.clone())
        .await
        .unwrap();

    let task = TaskBuilder::new().build();
    broker.publish_task("test-queue", &task).await.unwrap();

    let delivered = wait_until(Duration::from_secs(2), || {
        let recorder = recorder.clone();
        async move { recorder.count() == 1 }
    })
    .await;
    assert!(delivered);
    assert_eq!(recorder.seen.lock().unwrap()[0], task.id);
}

#[tokio::test]
async fn test_queues_are_isolated() {
    let broker = InMemoryBroker::new();
    let r1 = Recorder::new();
    let r2 = Recorder::new();
    broker.subscribe_for_tasks("q1", r1.clone()).await.unwrap();
    broker.subscribe_for_tasks("q2", r2.clone()).await.unwrap();

    broker
        .publish_task("q1", &TaskBuilder::new().build())
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            let r1 = r1.clone();
            async move { r1.count() == 1 }
        })
        .await
    );
    assert_eq!(r2.count(), 0);
}

#[tokio::test]
async fn test_fifo_delivery_order() {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::new();
    broker
        .subscribe_for_tasks("ordered", recorder.clone())
        .await
        .unwrap();

    for i in 0..20 {
        broker
            .publish_task("ordered", &TaskBuilder::new().id(&format!("t{i}")).build())
            .await
            .unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(2), || {
            let recorder = recorder.clone();
            async move { recorder.count() == 20 }
        })
        .await
    );
    let seen = recorder.seen.lock().unwrap().clone();
    let expected: Vec<String> = (0..20).map(|i| format!("t{i}")).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_retryable_failure_is_redelivered() {
    let broker = InMemoryBroker::with_config(BrokerConfig {
        max_delivery_attempts: 3,
        redelivery_backoff: Duration::from_millis(10),
        poll_interval: Duration::from_millis(5),
    });
    let handler = Arc::new(FlakyHandler {
        failures: 2,
        attempts: AtomicUsize::new(0),
    });
    broker
        .subscribe_for_tasks("flaky", handler.clone())
        .await
        .unwrap();
    broker
        .publish_task("flaky", &TaskBuilder::new().build())
        .await
        .unwrap();

    let delivered = wait_until(Duration::from_secs(2), || {
        let handler = handler.clone();
        async move { handler.attempts.load(Ordering::SeqCst) == 3 }
    })
    .await;
    assert!(delivered);
}

#[tokio::test]
async fn test_exhausted_task_goes_to_dead_letter() {
    let broker = InMemoryBroker::with_config(BrokerConfig {
        max_delivery_attempts: 2,
        redelivery_backoff: Duration::from_millis(5),
        poll_interval: Duration::from_millis(5),
    });
    let dead = Recorder::new();
    broker
        .subscribe_for_tasks(QUEUE_ERROR, dead.clone())
        .await
        .unwrap();

    struct AlwaysFails;
    #[async_trait]
    impl TaskHandler for AlwaysFails {
        async fn handle(&self, _task: Task) -> EngineResult<()> {
            Err(EngineError::broker("permanent failure"))
        }
    }
    broker
        .subscribe_for_tasks("doomed", Arc::new(AlwaysFails))
        .await
        .unwrap();

    let task = TaskBuilder::new().build();
    broker.publish_task("doomed", &task).await.unwrap();

    let dead_lettered = wait_until(Duration::from_secs(2), || {
        let dead = dead.clone();
        async move { dead.count() == 1 }
    })
    .await;
    assert!(dead_lettered);
    assert_eq!(dead.seen.lock().unwrap()[0], task.id);
}

#[tokio::test]
async fn test_job_heartbeat_and_log_planes() {
    let broker = InMemoryBroker::new();
    let jobs = Recorder::new();
    let nodes = Recorder::new();
    let logs = Recorder::new();
    broker.subscribe_for_jobs(jobs.clone()).await.unwrap();
    broker
        .subscribe_for_heartbeats(nodes.clone())
        .await
        .unwrap();
    broker.subscribe_for_logs(logs.clone()).await.unwrap();

    broker.publish_job(&Job::default()).await.unwrap();
    broker.publish_heartbeat(&Node::default()).await.unwrap();
    broker
        .publish_log_part(&TaskLogPart {
            contents: "hello".to_string(),
            ..TaskLogPart::default()
        })
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            let jobs = jobs.clone();
            let nodes = nodes.clone();
            let logs = logs.clone();
            async move { jobs.count() == 1 && nodes.count() == 1 && logs.count() == 1 }
        })
        .await
    );
}

#[tokio::test]
async fn test_queue_introspection() {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::new();
    broker
        .subscribe_for_tasks("watched", recorder.clone())
        .await
        .unwrap();
    broker.shutdown().await.unwrap();

    // 订阅循环停止后入队的消息停留在队列里
    broker
        .publish_task("watched", &TaskBuilder::new().build())
        .await
        .unwrap();
    broker
        .publish_task("watched", &TaskBuilder::new().build())
        .await
        .unwrap();

    let queues = broker.queues().await.unwrap();
    let watched = queues.iter().find(|q| q.name == "watched").unwrap();
    assert_eq!(watched.size, 2);
    assert_eq!(watched.subscribers, 1);
    assert!(queues.iter().any(|q| q.name == "jobs"));
    assert!(queues.iter().any(|q| q.name == "heartbeat"));
    assert!(queues.iter().any(|q| q.name == "logs"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_consumers_split_work() {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::new();
    // 同一队列的两个订阅构成竞争消费
    broker
        .subscribe_for_tasks("shared", recorder.clone())
        .await
        .unwrap();
    broker
        .subscribe_for_tasks("shared", recorder.clone())
        .await
        .unwrap();

    for i in 0..50 {
        broker
            .publish_task("shared", &TaskBuilder::new().id(&format!("t{i}")).build())
            .await
            .unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(3), || {
            let recorder = recorder.clone();
            async move { recorder.count() == 50 }
        })
        .await
    );
    // 没有重复投递
    let mut seen = recorder.seen.lock().unwrap().clone();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 50);
}
