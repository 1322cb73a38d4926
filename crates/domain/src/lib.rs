//! 领域模型
//!
//! 定义作业、任务、节点等核心业务实体，以及数据存储与消息队列的
//! 抽象端口。实体不依赖任何具体存储或队列实现。

pub mod duration;
pub mod messaging;
pub mod models;
pub mod repositories;

pub use conveyor_errors::{EngineError, EngineResult};
pub use duration::parse_duration;
pub use messaging::*;
pub use models::*;
pub use repositories::*;
