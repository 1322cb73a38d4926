use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use conveyor_coordinator::{Coordinator, CoordinatorConfig, NaiveScheduler, Scheduler};
use conveyor_domain::{
    node_queue, Broker, Datastore, Job, JobState, Node, SubJobTask, Task, TaskHandler, TaskState,
    QUEUE_COMPLETED, QUEUE_ERROR, QUEUE_PENDING, QUEUE_STARTED,
};
use conveyor_errors::EngineResult;
use conveyor_infrastructure::{InMemoryBroker, InMemoryDatastore};
use conveyor_testing_utils::{wait_until, JobBuilder, TaskBuilder};

const WAIT: Duration = Duration::from_secs(5);

async fn engine() -> (Arc<InMemoryDatastore>, Arc<InMemoryBroker>) {
    let datastore = Arc::new(InMemoryDatastore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let coordinator = Coordinator::with_config(
        datastore.clone(),
        broker.clone(),
        CoordinatorConfig {
            heartbeat_interval: Duration::from_millis(200),
        },
    );
    coordinator.start().await.unwrap();
    (datastore, broker)
}

/// 记录投递任务的测试处理器
struct Recorder {
    seen: Mutex<Vec<Task>>,
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
        self.seen.lock().unwrap().push(task);
        Ok(())
    }
}

/// 模拟工作节点：前 `failures` 次上报失败，之后上报成功
struct FakeWorker {
    broker: Arc<InMemoryBroker>,
    failures: usize,
    attempts: AtomicUsize,
    result: String,
}

#[async_trait]
impl TaskHandler for FakeWorker {
    async fn handle(&self, mut task: Task) -> EngineResult<()> {
        if task.state != TaskState::Scheduled {
            return Ok(());
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        task.node_id = Some("fake-node".to_string());
        task.state = TaskState::Running;
        task.started_at = Some(Utc::now());
        self.broker.publish_task(QUEUE_STARTED, &task).await?;
        if attempt < self.failures {
            task.state = TaskState::Failed;
            task.failed_at = Some(Utc::now());
            task.error = Some("simulated failure".to_string());
            self.broker.publish_task(QUEUE_ERROR, &task).await
        } else {
            task.state = TaskState::Completed;
            task.completed_at = Some(Utc::now());
            task.result = Some(self.result.clone());
            self.broker.publish_task(QUEUE_COMPLETED, &task).await
        }
    }
}

async fn submit(datastore: &Arc<InMemoryDatastore>, broker: &Arc<InMemoryBroker>, job: Job) -> Job {
    let created = datastore.create_job(&job).await.unwrap();
    broker.publish_job(&created).await.unwrap();
    created
}

async fn wait_for_job_state(
    datastore: &Arc<InMemoryDatastore>,
    job_id: &str,
    state: JobState,
) -> bool {
    wait_until(WAIT, || {
        let datastore = datastore.clone();
        let job_id = job_id.to_string();
        async move {
            datastore
                .get_job_by_id(&job_id)
                .await
                .map(|j| j.state == state)
                .unwrap_or(false)
        }
    })
    .await
}

#[tokio::test]
async fn test_pending_task_routes_to_custom_queue() {
    let (datastore, broker) = engine().await;
    let recorder = Recorder::new();
    broker
        .subscribe_for_tasks("test-queue", recorder.clone())
        .await
        .unwrap();

    let job = datastore
        .create_job(&JobBuilder::new().name("test job").build())
        .await
        .unwrap();
    let task = datastore
        .create_task(
            &TaskBuilder::new()
                .job_id(&job.id)
                .queue("test-queue")
                .state(TaskState::Pending)
                .run("echo hi")
                .build(),
        )
        .await
        .unwrap();
    broker.publish_task(QUEUE_PENDING, &task).await.unwrap();

    assert!(
        wait_until(WAIT, || {
            let recorder = recorder.clone();
            async move { recorder.count() == 1 }
        })
        .await
    );

    let stored = datastore.get_task_by_id(&task.id).await.unwrap();
    assert_eq!(stored.state, TaskState::Scheduled);
    assert!(stored.scheduled_at.is_some());
}

#[tokio::test]
async fn test_conditional_task_is_skipped() {
    let (datastore, broker) = engine().await;

    let task = datastore
        .create_task(
            &TaskBuilder::new()
                .if_expr("false")
                .queue("test-queue")
                .state(TaskState::Pending)
                .build(),
        )
        .await
        .unwrap();
    broker.publish_task(QUEUE_PENDING, &task).await.unwrap();

    assert!(
        wait_until(WAIT, || {
            let datastore = datastore.clone();
            let id = task.id.clone();
            async move {
                datastore
                    .get_task_by_id(&id)
                    .await
                    .map(|t| t.state == TaskState::Skipped)
                    .unwrap_or(false)
            }
        })
        .await
    );
}

#[tokio::test]
async fn test_skipped_task_advances_job() {
    let (datastore, broker) = engine().await;
    let sink = Arc::new(FakeWorker {
        broker: broker.clone(),
        failures: 0,
        attempts: AtomicUsize::new(0),
        result: "downstream ran".to_string(),
    });
    broker.subscribe_for_tasks("sink", sink).await.unwrap();

    let job = JobBuilder::new()
        .tasks(vec![
            TaskBuilder::new()
                .name("skipped one")
                .if_expr("false")
                .build(),
            TaskBuilder::new().name("real one").queue("sink").build(),
        ])
        .build();
    let job = submit(&datastore, &broker, job).await;

    assert!(wait_for_job_state(&datastore, &job.id, JobState::Completed).await);
    let stored = datastore.get_job_by_id(&job.id).await.unwrap();
    assert_eq!(stored.task_count, 2);
}

#[tokio::test]
async fn test_parallel_expansion_completes_parent() {
    let (datastore, broker) = engine().await;

    // 三个子任务全部经条件跳过，父任务与作业仍须推进
    let children = vec![
        TaskBuilder::new().name("c1").if_expr("false").build(),
        TaskBuilder::new().name("c2").if_expr("false").build(),
        TaskBuilder::new().name("c3").if_expr("false").build(),
    ];
    let parent_template = TaskBuilder::new().name("fanout").parallel(children).build();
    let job = submit(
        &datastore,
        &broker,
        JobBuilder::new().tasks(vec![parent_template]).build(),
    )
    .await;

    assert!(wait_for_job_state(&datastore, &job.id, JobState::Completed).await);

    let job = datastore.get_job_by_id(&job.id).await.unwrap();
    assert_eq!(job.task_count, 4);

    let active = datastore.get_active_tasks(&job.id).await.unwrap();
    assert!(active.is_empty());
}

#[tokio::test]
async fn test_each_empty_list_completes_immediately() {
    let (datastore, broker) = engine().await;

    let template = TaskBuilder::new()
        .name("loop")
        .each("[]", TaskBuilder::new().name("item").build(), 0)
        .build();
    let job = submit(
        &datastore,
        &broker,
        JobBuilder::new().tasks(vec![template]).build(),
    )
    .await;

    assert!(wait_for_job_state(&datastore, &job.id, JobState::Completed).await);
    // 空列表的父任务完成计数为零
    let job = datastore.get_job_by_id(&job.id).await.unwrap();
    assert_eq!(job.task_count, 1);
}

#[tokio::test]
async fn test_each_expands_and_throttles() {
    let (datastore, broker) = engine().await;

    let template = TaskBuilder::new()
        .name("loop")
        .each(
            "[1, 2, 3, 4, 5]",
            TaskBuilder::new().name("item").if_expr("false").build(),
            2,
        )
        .build();
    let job = submit(
        &datastore,
        &broker,
        JobBuilder::new().tasks(vec![template]).build(),
    )
    .await;

    assert!(wait_for_job_state(&datastore, &job.id, JobState::Completed).await);
    let job = datastore.get_job_by_id(&job.id).await.unwrap();
    // 父任务 + 5 个元素
    assert_eq!(job.task_count, 6);
}

#[tokio::test]
async fn test_retry_until_success() {
    let (datastore, broker) = engine().await;
    let worker = Arc::new(FakeWorker {
        broker: broker.clone(),
        failures: 2,
        attempts: AtomicUsize::new(0),
        result: "ok".to_string(),
    });
    broker
        .subscribe_for_tasks("sink", worker.clone())
        .await
        .unwrap();

    let template = TaskBuilder::new()
        .name("flaky")
        .queue("sink")
        .retry(3)
        .var("flaky_out")
        .build();
    let job = submit(
        &datastore,
        &broker,
        JobBuilder::new().tasks(vec![template]).build(),
    )
    .await;

    assert!(wait_for_job_state(&datastore, &job.id, JobState::Completed).await);
    assert_eq!(worker.attempts.load(Ordering::SeqCst), 3);

    let job = datastore.get_job_by_id(&job.id).await.unwrap();
    assert_eq!(job.context.tasks.get("flaky_out").map(String::as_str), Some("ok"));
}

#[tokio::test]
async fn test_retry_exhaustion_fails_job() {
    let (datastore, broker) = engine().await;
    let worker = Arc::new(FakeWorker {
        broker: broker.clone(),
        failures: usize::MAX,
        attempts: AtomicUsize::new(0),
        result: String::new(),
    });
    broker.subscribe_for_tasks("sink", worker).await.unwrap();

    let template = TaskBuilder::new().name("doomed").queue("sink").retry(2).build();
    let job = submit(
        &datastore,
        &broker,
        JobBuilder::new().tasks(vec![template]).build(),
    )
    .await;

    assert!(wait_for_job_state(&datastore, &job.id, JobState::Failed).await);
    let job = datastore.get_job_by_id(&job.id).await.unwrap();
    assert!(job.error.is_some());
}

#[tokio::test]
async fn test_subjob_output_propagates_to_parent() {
    let (datastore, broker) = engine().await;

    let sub_template = TaskBuilder::new().name("inner").if_expr("false").build();
    let mut parent_template = TaskBuilder::new().name("sub").var("sub_out").build();
    parent_template.subjob = Some(SubJobTask {
        name: "nested".to_string(),
        tasks: vec![sub_template],
        output: Some("nested done".to_string()),
        ..SubJobTask::default()
    });

    let job = submit(
        &datastore,
        &broker,
        JobBuilder::new().tasks(vec![parent_template]).build(),
    )
    .await;

    assert!(wait_for_job_state(&datastore, &job.id, JobState::Completed).await);
    let job = datastore.get_job_by_id(&job.id).await.unwrap();
    assert_eq!(
        job.context.outputs.get("nested").map(String::as_str),
        Some("nested done")
    );
    assert_eq!(
        job.context.tasks.get("sub_out").map(String::as_str),
        Some("nested done")
    );
}

#[tokio::test]
async fn test_detached_subjob_completes_parent_on_submission() {
    let (datastore, broker) = engine().await;

    // 分离子作业的内部任务永远不会执行（无人消费 never 队列）
    let sub_template = TaskBuilder::new().name("inner").queue("never").build();
    let mut parent_template = TaskBuilder::new().name("sub").build();
    parent_template.subjob = Some(SubJobTask {
        name: "detached".to_string(),
        tasks: vec![sub_template],
        detached: true,
        ..SubJobTask::default()
    });

    let job = submit(
        &datastore,
        &broker,
        JobBuilder::new().tasks(vec![parent_template]).build(),
    )
    .await;

    assert!(wait_for_job_state(&datastore, &job.id, JobState::Completed).await);
}

#[tokio::test]
async fn test_heartbeat_registers_and_refreshes_node() {
    let (datastore, broker) = engine().await;

    let node = Node {
        id: "node-1".to_string(),
        hostname: "host-a".to_string(),
        task_count: 0,
        ..Node::default()
    };
    broker.publish_heartbeat(&node).await.unwrap();

    assert!(
        wait_until(WAIT, || {
            let datastore = datastore.clone();
            async move { datastore.get_node_by_id("node-1").await.is_ok() }
        })
        .await
    );

    let mut refreshed = node.clone();
    refreshed.task_count = 7;
    refreshed.last_heartbeat_at = Utc::now();
    broker.publish_heartbeat(&refreshed).await.unwrap();

    assert!(
        wait_until(WAIT, || {
            let datastore = datastore.clone();
            async move {
                datastore
                    .get_node_by_id("node-1")
                    .await
                    .map(|n| n.task_count == 7)
                    .unwrap_or(false)
            }
        })
        .await
    );
}

#[tokio::test]
async fn test_scheduler_picks_least_loaded_node() {
    let datastore = Arc::new(InMemoryDatastore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let scheduler = NaiveScheduler::new(
        datastore.clone(),
        broker.clone(),
        Duration::from_secs(30),
    );

    for (id, count) in [("node-a", 5), ("node-b", 1), ("node-c", 3)] {
        datastore
            .create_node(&Node {
                id: id.to_string(),
                task_count: count,
                last_heartbeat_at: Utc::now(),
                ..Node::default()
            })
            .await
            .unwrap();
    }
    let recorder = Recorder::new();
    broker
        .subscribe_for_tasks(&node_queue("node-b"), recorder.clone())
        .await
        .unwrap();

    scheduler
        .schedule(TaskBuilder::new().state(TaskState::Scheduled).build())
        .await
        .unwrap();

    assert!(
        wait_until(WAIT, || {
            let recorder = recorder.clone();
            async move { recorder.count() == 1 }
        })
        .await
    );
}

#[tokio::test]
async fn test_scheduler_tie_breaks_lexicographically() {
    let datastore = Arc::new(InMemoryDatastore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let scheduler = NaiveScheduler::new(
        datastore.clone(),
        broker.clone(),
        Duration::from_secs(30),
    );

    for id in ["node-z", "node-a", "node-m"] {
        datastore
            .create_node(&Node {
                id: id.to_string(),
                task_count: 2,
                last_heartbeat_at: Utc::now(),
                ..Node::default()
            })
            .await
            .unwrap();
    }
    let recorder = Recorder::new();
    broker
        .subscribe_for_tasks(&node_queue("node-a"), recorder.clone())
        .await
        .unwrap();

    scheduler
        .schedule(TaskBuilder::new().state(TaskState::Scheduled).build())
        .await
        .unwrap();

    assert!(
        wait_until(WAIT, || {
            let recorder = recorder.clone();
            async move { recorder.count() == 1 }
        })
        .await
    );
}

#[tokio::test]
async fn test_scheduler_honors_gpu_and_freshness() {
    let datastore = Arc::new(InMemoryDatastore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let scheduler = NaiveScheduler::new(
        datastore.clone(),
        broker.clone(),
        Duration::from_secs(30),
    );

    // 负载最低的节点心跳已过期；次低的没有 GPU；只剩 gpu-node
    datastore
        .create_node(&Node {
            id: "stale-node".to_string(),
            task_count: 0,
            last_heartbeat_at: Utc::now() - chrono::Duration::seconds(600),
            gpu: true,
            ..Node::default()
        })
        .await
        .unwrap();
    datastore
        .create_node(&Node {
            id: "cpu-node".to_string(),
            task_count: 1,
            last_heartbeat_at: Utc::now(),
            gpu: false,
            ..Node::default()
        })
        .await
        .unwrap();
    datastore
        .create_node(&Node {
            id: "gpu-node".to_string(),
            task_count: 4,
            last_heartbeat_at: Utc::now(),
            gpu: true,
            ..Node::default()
        })
        .await
        .unwrap();

    let recorder = Recorder::new();
    broker
        .subscribe_for_tasks(&node_queue("gpu-node"), recorder.clone())
        .await
        .unwrap();

    let mut task = TaskBuilder::new().state(TaskState::Scheduled).build();
    task.gpus = Some("all".to_string());
    scheduler.schedule(task).await.unwrap();

    assert!(
        wait_until(WAIT, || {
            let recorder = recorder.clone();
            async move { recorder.count() == 1 }
        })
        .await
    );
}

#[tokio::test]
async fn test_scheduler_without_nodes_is_unavailable() {
    let datastore = Arc::new(InMemoryDatastore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let scheduler = NaiveScheduler::new(
        datastore.clone(),
        broker.clone(),
        Duration::from_secs(30),
    );
    let err = scheduler
        .schedule(TaskBuilder::new().build())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_cancel_job_cancels_active_tasks() {
    let (datastore, broker) = engine().await;

    // 任务滞留在无人消费的队列里，保持活跃
    let template = TaskBuilder::new().name("stuck").queue("never").build();
    let job = submit(
        &datastore,
        &broker,
        JobBuilder::new().tasks(vec![template]).build(),
    )
    .await;

    assert!(wait_for_job_state(&datastore, &job.id, JobState::Running).await);

    let mut cancel = datastore.get_job_by_id(&job.id).await.unwrap();
    cancel.state = JobState::Cancelled;
    broker.publish_job(&cancel).await.unwrap();

    assert!(wait_for_job_state(&datastore, &job.id, JobState::Cancelled).await);
    assert!(
        wait_until(WAIT, || {
            let datastore = datastore.clone();
            let job_id = job.id.clone();
            async move {
                datastore
                    .get_active_tasks(&job_id)
                    .await
                    .map(|tasks| tasks.is_empty())
                    .unwrap_or(false)
            }
        })
        .await
    );
}

#[tokio::test]
async fn test_timeout_watchdog_cancels_task() {
    let (datastore, broker) = engine().await;

    // 模拟只上报开始、永不完成的节点
    struct StartOnly {
        broker: Arc<InMemoryBroker>,
    }
    #[async_trait]
    impl TaskHandler for StartOnly {
        async fn handle(&self, mut task: Task) -> EngineResult<()> {
            if task.state != TaskState::Scheduled {
                return Ok(());
            }
            task.state = TaskState::Running;
            task.started_at = Some(Utc::now());
            task.node_id = Some("slow-node".to_string());
            self.broker.publish_task(QUEUE_STARTED, &task).await
        }
    }
    broker
        .subscribe_for_tasks(
            "sink",
            Arc::new(StartOnly {
                broker: broker.clone(),
            }),
        )
        .await
        .unwrap();

    let template = TaskBuilder::new()
        .name("hang")
        .queue("sink")
        .timeout("200ms")
        .build();
    let job = submit(
        &datastore,
        &broker,
        JobBuilder::new().tasks(vec![template]).build(),
    )
    .await;

    assert!(wait_for_job_state(&datastore, &job.id, JobState::Cancelled).await);
    let tasks = datastore.get_active_tasks(&job.id).await.unwrap();
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn test_var_capture_feeds_downstream_templates() {
    let (datastore, broker) = engine().await;
    let worker = Arc::new(FakeWorker {
        broker: broker.clone(),
        failures: 0,
        attempts: AtomicUsize::new(0),
        result: "captured-value".to_string(),
    });
    broker.subscribe_for_tasks("sink", worker).await.unwrap();
    let recorder = Recorder::new();
    broker
        .subscribe_for_tasks("inspect", recorder.clone())
        .await
        .unwrap();

    let job = JobBuilder::new()
        .tasks(vec![
            TaskBuilder::new().name("producer").queue("sink").var("out").build(),
            {
                let mut consumer = TaskBuilder::new().name("consumer").queue("inspect").build();
                consumer
                    .env
                    .insert("UPSTREAM".to_string(), "${ tasks.out }".to_string());
                consumer
            },
        ])
        .build();
    submit(&datastore, &broker, job).await;

    assert!(
        wait_until(WAIT, || {
            let recorder = recorder.clone();
            async move { recorder.count() == 1 }
        })
        .await
    );
    let delivered = recorder.seen.lock().unwrap()[0].clone();
    assert_eq!(
        delivered.env.get("UPSTREAM").map(String::as_str),
        Some("captured-value")
    );
}
