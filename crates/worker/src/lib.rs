//! 工作节点
//!
//! 订阅本节点的派发队列，经运行时执行任务并上报结果；按固定
//! 间隔发送心跳维持节点注册。

pub mod service;

pub use service::{Worker, WorkerConfig};
