//! 状态处理器
//!
//! 每个处理器对应一个保留队列，是状态机的事务边界。处理器对
//! 重放消息幂等：终态任务的事件被忽略。

pub mod completed;
pub mod error;
pub mod heartbeat;
pub mod job;
pub mod log;
pub mod pending;
pub mod scheduled;
pub mod started;

pub use completed::CompletedTaskHandler;
pub use error::FailedTaskHandler;
pub use heartbeat::HeartbeatHandler;
pub use job::JobLifecycleHandler;
pub use log::LogPartHandler;
pub use pending::PendingTaskHandler;
pub use scheduled::ScheduledTaskHandler;
pub use started::StartedTaskHandler;

use chrono::Utc;
use conveyor_domain::{Task, TaskState};
use uuid::Uuid;

/// 从模板实例化一个待执行任务
pub(crate) fn instantiate(template: &Task, job_id: &str, position: usize) -> Task {
    let mut task = template.clone();
    task.id = Uuid::new_v4().to_string();
    task.job_id = job_id.to_string();
    task.position = position;
    task.state = TaskState::Pending;
    task.created_at = Some(Utc::now());
    task
}
