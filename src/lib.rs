//! Conveyor — 分布式容器化工作流引擎
//!
//! 作业是有序的任务流水线，经消息队列分发到工作节点的容器中
//! 执行，由协调器驱动状态机。本 crate 把各组件装配为可嵌入的
//! 引擎，并提供命令行入口。

pub mod app;
pub mod config;
pub mod shutdown;

pub use app::{Engine, EngineMode};
pub use config::EngineConfig;
pub use shutdown::ShutdownManager;

pub use conveyor_domain as domain;
pub use conveyor_errors::{EngineError, EngineResult};
pub use conveyor_input as input;
