//! 数据存储端口
//!
//! 单一 `Datastore` 接口覆盖全部实体的读写。读取返回深拷贝，
//! 写入通过闭包式原子更新完成：读者要么看到更新前、要么看到
//! 更新后的完整状态，绝不出现部分写入。

use async_trait::async_trait;
use conveyor_errors::EngineResult;

use crate::models::{Job, Node, Page, Role, Task, TaskLogPart, User};

/// 作业原子更新闭包
pub type JobMutator = Box<dyn FnOnce(&mut Job) -> EngineResult<()> + Send>;
/// 任务原子更新闭包
pub type TaskMutator = Box<dyn FnOnce(&mut Task) -> EngineResult<()> + Send>;
/// 节点原子更新闭包
pub type NodeMutator = Box<dyn FnOnce(&mut Node) -> EngineResult<()> + Send>;

/// 数据存储抽象接口
///
/// `create_*` 返回存储后的实体副本：空 `id` 会在创建时分配，
/// 缺失的创建时间会被补齐。
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn create_job(&self, job: &Job) -> EngineResult<Job>;
    async fn get_job_by_id(&self, id: &str) -> EngineResult<Job>;
    /// 原子更新作业：加载、应用闭包、写回，对读者表现为原子
    async fn update_job(&self, id: &str, mutator: JobMutator) -> EngineResult<()>;
    /// 删除作业，连同其任务与任务日志一起移除
    async fn delete_job(&self, id: &str) -> EngineResult<()>;
    /// 按过滤语法与权限检索作业（`tag:x`、`tags:a,b`、自由文本）
    async fn get_jobs(
        &self,
        username: &str,
        query: &str,
        page: usize,
        size: usize,
    ) -> EngineResult<Page<Job>>;

    async fn create_task(&self, task: &Task) -> EngineResult<Task>;
    async fn get_task_by_id(&self, id: &str) -> EngineResult<Task>;
    async fn update_task(&self, id: &str, mutator: TaskMutator) -> EngineResult<()>;
    /// 删除任务及其日志分片
    async fn delete_task(&self, id: &str) -> EngineResult<()>;
    /// 作业的全部活跃任务（Pending / Scheduled / Running）
    async fn get_active_tasks(&self, job_id: &str) -> EngineResult<Vec<Task>>;
    /// 父任务下处于 Created 状态的最早子任务，用于顺序链推进
    async fn get_next_task(&self, parent_id: &str) -> EngineResult<Task>;

    async fn create_node(&self, node: &Node) -> EngineResult<Node>;
    async fn get_node_by_id(&self, id: &str) -> EngineResult<Node>;
    async fn update_node(&self, id: &str, mutator: NodeMutator) -> EngineResult<()>;
    async fn delete_node(&self, id: &str) -> EngineResult<()>;
    async fn get_active_nodes(&self) -> EngineResult<Vec<Node>>;

    async fn create_user(&self, user: &User) -> EngineResult<User>;
    async fn get_user(&self, username: &str) -> EngineResult<User>;
    async fn create_role(&self, role: &Role) -> EngineResult<Role>;
    async fn get_role(&self, slug: &str) -> EngineResult<Role>;
    async fn get_roles(&self) -> EngineResult<Vec<Role>>;
    async fn assign_role(&self, user_id: &str, role_id: &str) -> EngineResult<()>;
    async fn unassign_role(&self, user_id: &str, role_id: &str) -> EngineResult<()>;
    async fn get_user_roles(&self, user_id: &str) -> EngineResult<Vec<Role>>;

    /// 追加日志分片；`number` 为 0 时自动分配下一个分片号
    async fn create_task_log_part(&self, part: &TaskLogPart) -> EngineResult<TaskLogPart>;
    /// 任务日志，按分片号倒序，可按内容子串过滤
    async fn get_task_log_parts(
        &self,
        task_id: &str,
        contains: &str,
        page: usize,
        size: usize,
    ) -> EngineResult<Page<TaskLogPart>>;
    /// 作业全部任务的日志合并视图，按创建时间倒序
    async fn get_job_log_parts(
        &self,
        job_id: &str,
        contains: &str,
        page: usize,
        size: usize,
    ) -> EngineResult<Page<TaskLogPart>>;
}
