use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::Task;
use super::user::{Role, User};

/// 作业定义
///
/// 用户提交的流水线：一组有序的任务模板加共享上下文。根任务按
/// `position` 顺序依次实例化执行；结构化任务在执行中展开子任务。
///
/// # 字段说明
///
/// - `id`: 作业唯一标识符
/// - `state`: 作业状态（见 [`JobState`]）
/// - `tasks`: 有序的任务模板序列
/// - `position`: 下一个待实例化的根任务位置（从 1 开始）
/// - `inputs`: 提交时的输入键值
/// - `context`: 可变上下文（inputs / tasks / outputs）
/// - `task_count`: 已实例化的任务总数
/// - `permissions`: 访问控制（用户或角色）；为空表示公开
/// - `parent_id`: 子作业的父任务 ID
/// - `output`: 子作业完成时求值的输出表达式
/// - `auto_delete`: 终态后的自动删除窗口
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub description: String,
    pub state: JobState,
    pub tasks: Vec<Task>,
    pub position: usize,
    pub inputs: HashMap<String, String>,
    pub context: JobContext,
    pub task_count: usize,
    pub tags: Vec<String>,
    pub permissions: Vec<Permission>,
    pub parent_id: Option<String>,
    pub output: Option<String>,
    pub detached: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<User>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub auto_delete: Option<AutoDelete>,
    pub webhooks: Vec<Webhook>,
    pub error: Option<String>,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            description: String::new(),
            state: JobState::Pending,
            tasks: Vec::new(),
            position: 0,
            inputs: HashMap::new(),
            context: JobContext::default(),
            task_count: 0,
            tags: Vec::new(),
            permissions: Vec::new(),
            parent_id: None,
            output: None,
            detached: false,
            created_at: Utc::now(),
            created_by: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            auto_delete: None,
            webhooks: Vec::new(),
            error: None,
        }
    }
}

impl Job {
    /// 作业是否处于终态
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 作业进入终态的时间（用于过期清理）
    pub fn terminated_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            JobState::Completed => self.completed_at,
            JobState::Failed | JobState::Cancelled => self.failed_at.or(self.completed_at),
            _ => None,
        }
    }
}

/// 作业状态
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    #[default]
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "SCHEDULED")]
    Scheduled,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Scheduled => "SCHEDULED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }
}

/// 作业上下文
///
/// 表达式求值的根作用域：`inputs` 为提交输入，`tasks` 为经 `var`
/// 捕获的任务结果，`outputs` 为子作业输出。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobContext {
    pub inputs: HashMap<String, String>,
    pub tasks: HashMap<String, String>,
    pub outputs: HashMap<String, String>,
}

/// 访问权限
///
/// 指向用户或角色，二者不会同时出现在同一条权限中。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Permission {
    pub user: Option<User>,
    pub role: Option<Role>,
}

/// 终态后的自动删除窗口
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoDelete {
    /// 终态之后保留的时长（如 "1h"、"30m"）
    pub after: String,
}

/// 作业状态变更的回调通知
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Webhook {
    pub url: String,
    /// 触发事件，空值表示所有状态变更
    pub event: String,
    pub headers: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Pending.is_terminal());
    }

    #[test]
    fn test_job_state_round_trip() {
        let s = serde_json::to_string(&JobState::Running).unwrap();
        assert_eq!(s, "\"RUNNING\"");
        let back: JobState = serde_json::from_str(&s).unwrap();
        assert_eq!(back, JobState::Running);
    }

    #[test]
    fn test_terminated_at_prefers_failure_time() {
        let now = Utc::now();
        let job = Job {
            state: JobState::Failed,
            failed_at: Some(now),
            ..Job::default()
        };
        assert_eq!(job.terminated_at(), Some(now));

        let running = Job {
            state: JobState::Running,
            ..Job::default()
        };
        assert_eq!(running.terminated_at(), None);
    }
}
