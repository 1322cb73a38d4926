//! 引擎配置
//!
//! TOML 配置文件按组件分节，时长一律写成 "5m"、"30s" 这样的
//! 字符串。缺省值与配置文件缺失时的行为一致。

use serde::Deserialize;

use conveyor_domain::parse_duration;
use conveyor_errors::{EngineError, EngineResult};
use conveyor_infrastructure::DatastoreConfig;
use conveyor_worker::WorkerConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub datastore: DatastoreSection,
    pub coordinator: CoordinatorSection,
    pub worker: WorkerSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatastoreSection {
    pub cleanup_interval: String,
    pub node_expiration: String,
    pub job_expiration: String,
}

impl Default for DatastoreSection {
    fn default() -> Self {
        Self {
            cleanup_interval: "5m".to_string(),
            node_expiration: "5m".to_string(),
            job_expiration: "1h".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    pub heartbeat_interval: String,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            heartbeat_interval: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub id: Option<String>,
    pub heartbeat_interval: String,
    pub queues: Vec<String>,
    pub capacity: usize,
    pub gpu: bool,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            id: None,
            heartbeat_interval: "30s".to_string(),
            queues: Vec::new(),
            capacity: 0,
            gpu: false,
        }
    }
}

/// 时长为零的配置项表示关闭对应行为
fn duration_of(value: &str, field: &str) -> EngineResult<std::time::Duration> {
    if value.trim() == "0" {
        return Ok(std::time::Duration::ZERO);
    }
    parse_duration(value)
        .map_err(|e| EngineError::config(format!("配置项 {field} 无效: {e}")))
}

impl EngineConfig {
    /// 从 TOML 文件加载；路径缺省或文件不存在时使用默认配置
    pub fn load(path: Option<&str>) -> EngineResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !std::path::Path::new(path).exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::config(format!("读取配置文件 {path} 失败: {e}")))?;
        toml::from_str(&raw)
            .map_err(|e| EngineError::config(format!("解析配置文件 {path} 失败: {e}")))
    }

    pub fn datastore_config(&self) -> EngineResult<DatastoreConfig> {
        Ok(DatastoreConfig {
            cleanup_interval: duration_of(
                &self.datastore.cleanup_interval,
                "datastore.cleanup_interval",
            )?,
            node_expiration: duration_of(
                &self.datastore.node_expiration,
                "datastore.node_expiration",
            )?,
            job_expiration: duration_of(
                &self.datastore.job_expiration,
                "datastore.job_expiration",
            )?,
        })
    }

    pub fn heartbeat_interval(&self) -> EngineResult<std::time::Duration> {
        duration_of(
            &self.coordinator.heartbeat_interval,
            "coordinator.heartbeat_interval",
        )
    }

    pub fn worker_config(&self) -> EngineResult<WorkerConfig> {
        Ok(WorkerConfig {
            id: self.worker.id.clone(),
            heartbeat_interval: duration_of(
                &self.worker.heartbeat_interval,
                "worker.heartbeat_interval",
            )?,
            queues: self.worker.queues.clone(),
            capacity: self.worker.capacity,
            gpu: self.worker.gpu,
        })
    }
}
