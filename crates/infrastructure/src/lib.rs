//! 基础设施实现
//!
//! 领域端口的内存实现：并发安全的实体存储与带死信的消息队列。
//! 适用于嵌入式部署与测试；外部存储/队列按同样的端口另行接入。

pub mod inmemory_broker;
pub mod inmemory_datastore;

pub use inmemory_broker::{BrokerConfig, InMemoryBroker};
pub use inmemory_datastore::{DatastoreConfig, InMemoryDatastore};
