use thiserror::Error;

/// 引擎统一错误类型
///
/// 覆盖数据存储、消息队列、调度、运行时等各组件的错误分类。
/// 处理器根据 `is_retryable` 判断错误是否应交回队列重试。
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("作业未找到: {id}")]
    JobNotFound { id: String },
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("节点未找到: {id}")]
    NodeNotFound { id: String },
    #[error("用户未找到: {username}")]
    UserNotFound { username: String },
    #[error("角色未找到: {slug}")]
    RoleNotFound { slug: String },
    #[error("父任务 {parent_id} 没有待执行的后续任务")]
    NextTaskNotFound { parent_id: String },
    #[error("实体已存在: {id}")]
    Conflict { id: String },
    #[error("数据验证失败: {0}")]
    Validation(String),
    #[error("消息队列错误: {0}")]
    Broker(String),
    #[error("服务不可用: {0}")]
    Unavailable(String),
    #[error("表达式求值错误: {0}")]
    Eval(String),
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("退出码 {code}: {output}")]
    NonZeroExit { code: i32, output: String },
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("已取消")]
    Cancelled,
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn broker<S: Into<String>>(msg: S) -> Self {
        Self::Broker(msg.into())
    }
    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        Self::Unavailable(msg.into())
    }
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 错误是否属于未找到类
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::JobNotFound { .. }
                | EngineError::TaskNotFound { .. }
                | EngineError::NodeNotFound { .. }
                | EngineError::UserNotFound { .. }
                | EngineError::RoleNotFound { .. }
                | EngineError::NextTaskNotFound { .. }
        )
    }

    /// 错误是否可以通过重试恢复
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Broker(_) | EngineError::Unavailable(_) | EngineError::Timeout(_)
        )
    }

    /// 错误是否为不可恢复的致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Internal(_) | EngineError::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
