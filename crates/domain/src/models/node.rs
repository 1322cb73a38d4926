use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 工作节点
///
/// 节点在首次心跳时注册，此后由心跳维持活跃；心跳停止超过
/// 过期窗口后由数据存储清理。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub last_heartbeat_at: DateTime<Utc>,
    pub task_count: usize,
    /// 节点可同时运行的任务上限，0 表示不限制
    pub capacity: usize,
    /// 节点是否具备 GPU 能力（随心跳上报）
    pub gpu: bool,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            id: String::new(),
            hostname: String::new(),
            last_heartbeat_at: Utc::now(),
            task_count: 0,
            capacity: 0,
            gpu: false,
            status: NodeStatus::Up,
            started_at: None,
        }
    }
}

impl Node {
    /// 心跳是否仍在给定窗口内
    pub fn heartbeat_within(&self, window: Duration) -> bool {
        Utc::now() - self.last_heartbeat_at <= window
    }

    /// 节点是否还能接收新任务
    pub fn has_capacity(&self) -> bool {
        self.capacity == 0 || self.task_count < self.capacity
    }
}

/// 节点状态
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    #[default]
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_within() {
        let node = Node {
            last_heartbeat_at: Utc::now() - Duration::seconds(120),
            ..Node::default()
        };
        assert!(node.heartbeat_within(Duration::seconds(300)));
        assert!(!node.heartbeat_within(Duration::seconds(60)));
    }

    #[test]
    fn test_capacity() {
        let mut node = Node {
            capacity: 2,
            task_count: 1,
            ..Node::default()
        };
        assert!(node.has_capacity());
        node.task_count = 2;
        assert!(!node.has_capacity());
        node.capacity = 0;
        assert!(node.has_capacity());
    }
}
