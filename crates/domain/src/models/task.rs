use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务定义
///
/// 作业中的一个可执行单元。叶子任务在容器中执行；结构化任务
/// （`parallel`、`each`、`subjob`）不直接执行，而是展开为子任务。
///
/// # 字段说明
///
/// - `id`: 任务的唯一标识符
/// - `job_id`: 所属作业 ID
/// - `parent_id`: 父任务 ID（结构化展开或顺序链）
/// - `position`: 在父任务或作业中的顺序位置
/// - `state`: 任务状态（见 [`TaskState`]）
/// - `image` / `cmd` / `entrypoint` / `run`: 容器规格
/// - `retry`: 重试策略（上限与已尝试次数）
/// - `timeout`: 运行时长上限（如 "30s"、"5m"）
/// - `if_expr`: 条件表达式，求值为假时任务被跳过
/// - `var`: 结果在作业上下文中的捕获名
/// - `queue`: 自定义派发队列，覆盖调度器的节点选择
/// - `priority`: 优先级 0-9
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub id: String,
    pub job_id: String,
    pub parent_id: Option<String>,
    pub position: usize,
    pub name: String,
    pub description: String,
    pub state: TaskState,
    pub created_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub run: String,
    pub image: String,
    pub registry: Option<Registry>,
    pub env: HashMap<String, String>,
    pub files: HashMap<String, String>,
    pub queue: Option<String>,
    pub pre: Vec<Task>,
    pub post: Vec<Task>,
    pub sidecars: Vec<Task>,
    pub mounts: Vec<Mount>,
    pub networks: Vec<String>,
    pub retry: Option<TaskRetry>,
    pub limits: Option<TaskLimits>,
    pub timeout: Option<String>,
    pub var: Option<String>,
    #[serde(rename = "if")]
    pub if_expr: Option<String>,
    pub parallel: Option<ParallelTask>,
    pub each: Option<EachTask>,
    pub subjob: Option<SubJobTask>,
    pub gpus: Option<String>,
    pub tags: Vec<String>,
    pub workdir: Option<String>,
    pub priority: u8,
    pub node_id: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: String::new(),
            job_id: String::new(),
            parent_id: None,
            position: 0,
            name: String::new(),
            description: String::new(),
            state: TaskState::Created,
            created_at: None,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            cmd: Vec::new(),
            entrypoint: Vec::new(),
            run: String::new(),
            image: String::new(),
            registry: None,
            env: HashMap::new(),
            files: HashMap::new(),
            queue: None,
            pre: Vec::new(),
            post: Vec::new(),
            sidecars: Vec::new(),
            mounts: Vec::new(),
            networks: Vec::new(),
            retry: None,
            limits: None,
            timeout: None,
            var: None,
            if_expr: None,
            parallel: None,
            each: None,
            subjob: None,
            gpus: None,
            tags: Vec::new(),
            workdir: None,
            priority: 0,
            node_id: None,
            result: None,
            error: None,
        }
    }
}

impl Task {
    /// 任务是否为结构化任务（展开为子任务而非直接执行）
    pub fn is_structural(&self) -> bool {
        self.parallel.is_some() || self.each.is_some() || self.subjob.is_some()
    }

    /// 任务是否处于终态
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 任务是否还有剩余的重试额度
    pub fn can_retry(&self) -> bool {
        match &self.retry {
            Some(retry) => retry.attempts < retry.limit,
            None => false,
        }
    }
}

/// 任务状态
///
/// 状态只能沿允许的转换图前进，终态不再变更：
///
/// ```text
/// Created  -> Pending
/// Pending  -> Scheduled | Skipped | Failed
/// Scheduled-> Running   | Failed
/// Running  -> Completed | Failed | Cancelled
/// 任意非终态 -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    #[default]
    #[serde(rename = "CREATED")]
    Created,
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
    #[serde(rename = "SKIPPED")]
    Skipped,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl TaskState {
    /// 是否为终态（不再接受任何变更）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Skipped | TaskState::Cancelled
        )
    }

    /// 是否为活跃状态（计入作业的活跃任务集）
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskState::Pending | TaskState::Scheduled | TaskState::Running
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "CREATED",
            TaskState::Pending => "PENDING",
            TaskState::Scheduled => "SCHEDULED",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Skipped => "SKIPPED",
            TaskState::Cancelled => "CANCELLED",
        }
    }
}

/// 并行结构任务
///
/// 父任务保持 Running，全部子任务完成后由完成处理器推进父任务。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelTask {
    pub tasks: Vec<Task>,
    /// 已完成的子任务计数，由完成处理器原子递增
    pub completions: usize,
}

/// 逐元素迭代结构任务
///
/// `list` 表达式求值得到一个序列，每个元素绑定到 `var` 后实例化
/// 一个子任务。`concurrency` 大于 0 时按节流释放。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EachTask {
    pub var: String,
    pub list: String,
    pub task: Option<Box<Task>>,
    pub concurrency: usize,
    /// 求值后的序列长度，展开时记录
    pub size: usize,
    pub completions: usize,
}

/// 子作业结构任务
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubJobTask {
    pub name: String,
    pub description: String,
    pub tasks: Vec<Task>,
    pub inputs: HashMap<String, String>,
    /// 子作业完成时求值，结果写入父任务的 result
    pub output: Option<String>,
    /// 分离模式：提交即完成父任务，不等待子作业结束
    pub detached: bool,
    pub webhooks: Vec<super::job::Webhook>,
    pub auto_delete: Option<super::job::AutoDelete>,
}

/// 镜像仓库凭证
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    pub username: String,
    pub password: String,
}

/// 挂载配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Mount {
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    pub target: String,
}

pub const MOUNT_TYPE_BIND: &str = "bind";
pub const MOUNT_TYPE_VOLUME: &str = "volume";

/// 重试策略
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRetry {
    pub limit: u32,
    pub attempts: u32,
}

/// 资源限额
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskLimits {
    pub cpus: String,
    pub memory: String,
}

/// 任务日志分片
///
/// 同一任务的分片按 `number` 单调递增，读取时按分片号倒序返回。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskLogPart {
    pub task_id: String,
    pub number: u32,
    pub contents: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Created.is_terminal());
    }

    #[test]
    fn test_active_states() {
        assert!(TaskState::Pending.is_active());
        assert!(TaskState::Scheduled.is_active());
        assert!(TaskState::Running.is_active());
        assert!(!TaskState::Created.is_active());
        assert!(!TaskState::Completed.is_active());
    }

    #[test]
    fn test_state_serializes_as_upper_case() {
        let s = serde_json::to_string(&TaskState::Scheduled).unwrap();
        assert_eq!(s, "\"SCHEDULED\"");
        let back: TaskState = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(back, TaskState::Cancelled);
    }

    #[test]
    fn test_if_field_renames() {
        let task = Task {
            if_expr: Some("false".to_string()),
            ..Task::default()
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["if"], "false");
    }

    #[test]
    fn test_can_retry() {
        let mut task = Task {
            retry: Some(TaskRetry {
                limit: 3,
                attempts: 0,
            }),
            ..Task::default()
        };
        assert!(task.can_retry());
        task.retry = Some(TaskRetry {
            limit: 3,
            attempts: 3,
        });
        assert!(!task.can_retry());
        task.retry = None;
        assert!(!task.can_retry());
    }

    #[test]
    fn test_structural_detection() {
        let mut task = Task::default();
        assert!(!task.is_structural());
        task.parallel = Some(ParallelTask::default());
        assert!(task.is_structural());
    }
}
