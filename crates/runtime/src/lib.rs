//! 任务运行时
//!
//! 工作节点侧的执行契约：运行任务、流式输出日志、强制资源限额、
//! 上报退出结果。内置基于本地进程的 [`ShellRuntime`]；容器引擎
//! 按同一契约在外部接入，可复用这里的限额解析与拉取合并工具。

pub mod filter;
pub mod limits;
pub mod pull;
pub mod shell;

use async_trait::async_trait;
use conveyor_domain::Task;
use conveyor_errors::EngineResult;
use tokio::sync::mpsc;

pub use filter::filter_control_bytes;
pub use limits::{parse_cpus, parse_memory};
pub use pull::ImagePuller;
pub use shell::ShellRuntime;

/// 任务运行时契约
///
/// `run` 返回截断后的标准输出快照；非零退出以
/// [`conveyor_errors::EngineError::NonZeroExit`] 上报，携带退出码
/// 与输出快照。`stop` 终止正在运行的任务并清理其资源，对未知
/// 任务为幂等空操作。
#[async_trait]
pub trait TaskRuntime: Send + Sync {
    /// 运行任务，逐行推送输出到 `logs`
    async fn run(&self, task: &Task, logs: mpsc::UnboundedSender<String>)
        -> EngineResult<String>;

    /// 终止任务
    async fn stop(&self, task: &Task) -> EngineResult<()>;
}
