//! 协调器
//!
//! 任务/作业状态机的驱动方：每个保留队列绑定一个状态处理器，
//! 处理器读取一条事件、在取消边界内完成有限工作、再发出零或
//! 多条后续事件。消息队列的订阅表即是 (实体 × 事件) 的分发表。

pub mod coordinator;
pub mod handlers;
pub mod scheduler;
pub mod webhook;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use scheduler::{NaiveScheduler, Scheduler};
pub use webhook::WebhookNotifier;
