use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conveyor_domain as domain;

use crate::task::TaskInput;

/// 作业提交结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobInput {
    pub name: String,
    pub description: String,
    pub tasks: Vec<TaskInput>,
    pub inputs: HashMap<String, String>,
    pub tags: Vec<String>,
    pub permissions: Vec<PermissionInput>,
    pub webhooks: Vec<WebhookInput>,
    #[serde(rename = "autoDelete")]
    pub auto_delete: Option<AutoDeleteInput>,
}

/// 权限输入：用户名或角色 slug，二选一
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionInput {
    pub user: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookInput {
    pub url: String,
    pub event: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoDeleteInput {
    pub after: String,
}

impl WebhookInput {
    pub fn to_webhook(&self) -> domain::Webhook {
        domain::Webhook {
            url: self.url.clone(),
            event: self.event.clone(),
            headers: self.headers.clone(),
        }
    }
}

impl JobInput {
    /// 转换为领域作业，分配新 id 并初始化上下文
    pub fn to_job(&self) -> domain::Job {
        domain::Job {
            id: Uuid::new_v4().to_string(),
            name: self.name.clone(),
            description: self.description.clone(),
            state: domain::JobState::Pending,
            tasks: self.tasks.iter().map(TaskInput::to_task).collect(),
            inputs: self.inputs.clone(),
            context: domain::JobContext {
                inputs: self.inputs.clone(),
                ..domain::JobContext::default()
            },
            tags: self.tags.clone(),
            permissions: self
                .permissions
                .iter()
                .map(|p| domain::Permission {
                    user: p.user.as_ref().map(|username| domain::User {
                        username: username.clone(),
                        ..domain::User::default()
                    }),
                    role: p.role.as_ref().map(|slug| domain::Role {
                        slug: slug.clone(),
                        ..domain::Role::default()
                    }),
                })
                .collect(),
            webhooks: self.webhooks.iter().map(WebhookInput::to_webhook).collect(),
            auto_delete: self.auto_delete.as_ref().map(|a| domain::AutoDelete {
                after: a.after.clone(),
            }),
            ..domain::Job::default()
        }
    }
}
