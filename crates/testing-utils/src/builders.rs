//! Fluent builders for domain entities used in tests

use chrono::Utc;
use uuid::Uuid;

use conveyor_domain::{
    EachTask, Job, JobState, ParallelTask, Task, TaskRetry, TaskState,
};

/// Builder for test tasks
#[derive(Debug, Default)]
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            task: Task {
                id: Uuid::new_v4().to_string(),
                created_at: Some(Utc::now()),
                ..Task::default()
            },
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.task.id = id.to_string();
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.task.name = name.to_string();
        self
    }

    pub fn job_id(mut self, job_id: &str) -> Self {
        self.task.job_id = job_id.to_string();
        self
    }

    pub fn parent_id(mut self, parent_id: &str) -> Self {
        self.task.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn position(mut self, position: usize) -> Self {
        self.task.position = position;
        self
    }

    pub fn state(mut self, state: TaskState) -> Self {
        self.task.state = state;
        self
    }

    pub fn image(mut self, image: &str) -> Self {
        self.task.image = image.to_string();
        self
    }

    pub fn run(mut self, run: &str) -> Self {
        self.task.run = run.to_string();
        self
    }

    pub fn queue(mut self, queue: &str) -> Self {
        self.task.queue = Some(queue.to_string());
        self
    }

    pub fn var(mut self, var: &str) -> Self {
        self.task.var = Some(var.to_string());
        self
    }

    pub fn if_expr(mut self, expr: &str) -> Self {
        self.task.if_expr = Some(expr.to_string());
        self
    }

    pub fn timeout(mut self, timeout: &str) -> Self {
        self.task.timeout = Some(timeout.to_string());
        self
    }

    pub fn retry(mut self, limit: u32) -> Self {
        self.task.retry = Some(TaskRetry { limit, attempts: 0 });
        self
    }

    pub fn parallel(mut self, tasks: Vec<Task>) -> Self {
        self.task.parallel = Some(ParallelTask {
            tasks,
            completions: 0,
        });
        self
    }

    pub fn each(mut self, list: &str, task: Task, concurrency: usize) -> Self {
        self.task.each = Some(EachTask {
            var: "item".to_string(),
            list: list.to_string(),
            task: Some(Box::new(task)),
            concurrency,
            size: 0,
            completions: 0,
        });
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Builder for test jobs
#[derive(Debug, Default)]
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self {
            job: Job {
                id: Uuid::new_v4().to_string(),
                name: "test job".to_string(),
                ..Job::default()
            },
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.job.id = id.to_string();
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.job.name = name.to_string();
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.job.state = state;
        self
    }

    pub fn tasks(mut self, tasks: Vec<Task>) -> Self {
        self.job.tasks = tasks;
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.job.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn input(mut self, key: &str, value: &str) -> Self {
        self.job.inputs.insert(key.to_string(), value.to_string());
        self.job
            .context
            .inputs
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}
