use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 用户
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub username: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// 角色
///
/// `slug` 在系统内唯一，权限通过角色间接授予用户。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Role {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}
