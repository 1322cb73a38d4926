use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conveyor_domain::{
    parse_duration, Datastore, Job, JobMutator, Node, NodeMutator, Page, Role, Task, TaskLogPart,
    TaskMutator, User,
};
use conveyor_errors::{EngineError, EngineResult};

/// 内存数据存储配置
///
/// 过期时长为零表示关闭对应类别的清理。
#[derive(Debug, Clone)]
pub struct DatastoreConfig {
    /// 清理扫描间隔
    pub cleanup_interval: Duration,
    /// 节点心跳过期时长
    pub node_expiration: Duration,
    /// 终态作业保留时长
    pub job_expiration: Duration,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(5 * 60),
            node_expiration: Duration::from_secs(5 * 60),
            job_expiration: Duration::from_secs(60 * 60),
        }
    }
}

type Cell<T> = Arc<Mutex<T>>;
type EntityMap<T> = Arc<RwLock<HashMap<String, Cell<T>>>>;

/// 内存数据存储
///
/// 顶层映射由读写锁保护，每个实体再由独立互斥锁保护，更新闭包
/// 在实体锁内应用到副本、成功后整体写回，读者只会看到更新前后
/// 的完整状态。锁只包住纯内存操作，不跨越任何 I/O。
pub struct InMemoryDatastore {
    jobs: EntityMap<Job>,
    tasks: EntityMap<Task>,
    nodes: EntityMap<Node>,
    users: Arc<RwLock<HashMap<String, User>>>,
    roles: Arc<RwLock<HashMap<String, Role>>>,
    user_roles: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    log_parts: Arc<RwLock<HashMap<String, Vec<TaskLogPart>>>>,
    config: DatastoreConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryDatastore {
    /// 使用默认配置创建实例（需在 tokio 运行时内调用）
    pub fn new() -> Self {
        Self::with_config(DatastoreConfig::default())
    }

    /// 使用指定配置创建实例并启动清理扫描
    pub fn with_config(config: DatastoreConfig) -> Self {
        let store = Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            nodes: Arc::new(RwLock::new(HashMap::new())),
            users: Arc::new(RwLock::new(HashMap::new())),
            roles: Arc::new(RwLock::new(HashMap::new())),
            user_roles: Arc::new(RwLock::new(HashMap::new())),
            log_parts: Arc::new(RwLock::new(HashMap::new())),
            config,
            sweeper: Mutex::new(None),
        };
        store.start_sweeper();
        store
    }

    fn start_sweeper(&self) {
        if self.config.cleanup_interval.is_zero() {
            return;
        }
        if self.config.node_expiration.is_zero() && self.config.job_expiration.is_zero() {
            return;
        }
        let jobs = self.jobs.clone();
        let tasks = self.tasks.clone();
        let nodes = self.nodes.clone();
        let log_parts = self.log_parts.clone();
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweep(&jobs, &tasks, &nodes, &log_parts, &config);
            }
        });
        if let Ok(mut sweeper) = self.sweeper.lock() {
            *sweeper = Some(handle);
        }
    }

    fn user_by_username(&self, username: &str) -> Option<User> {
        let users = self.users.read().unwrap();
        users.values().find(|u| u.username == username).cloned()
    }

    fn roles_of(&self, user_id: &str) -> Vec<Role> {
        let assigned = {
            let user_roles = self.user_roles.read().unwrap();
            user_roles.get(user_id).cloned().unwrap_or_default()
        };
        let roles = self.roles.read().unwrap();
        assigned
            .iter()
            .filter_map(|role_id| roles.get(role_id).cloned())
            .collect()
    }
}

impl Default for InMemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryDatastore {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}

/// 一轮清理：过期的终态作业（连带任务与日志）与心跳停止的节点
fn sweep(
    jobs: &EntityMap<Job>,
    tasks: &EntityMap<Task>,
    nodes: &EntityMap<Node>,
    log_parts: &Arc<RwLock<HashMap<String, Vec<TaskLogPart>>>>,
    config: &DatastoreConfig,
) {
    let now = Utc::now();

    if !config.node_expiration.is_zero() {
        let cutoff = now
            - chrono::Duration::from_std(config.node_expiration)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut map = nodes.write().unwrap();
        let before = map.len();
        map.retain(|_, cell| {
            let node = cell.lock().unwrap();
            node.last_heartbeat_at > cutoff
        });
        let evicted = before - map.len();
        if evicted > 0 {
            info!("Evicted {} stale node(s)", evicted);
        }
    }

    let mut expired_jobs: Vec<String> = Vec::new();
    {
        let map = jobs.read().unwrap();
        for (id, cell) in map.iter() {
            let job = cell.lock().unwrap();
            if !job.is_terminal() {
                continue;
            }
            let window = match &job.auto_delete {
                Some(auto_delete) => match parse_duration(&auto_delete.after) {
                    Ok(window) => window,
                    Err(_) => config.job_expiration,
                },
                None => config.job_expiration,
            };
            if window.is_zero() {
                continue;
            }
            let ended = job.terminated_at().unwrap_or(job.created_at);
            let cutoff = now
                - chrono::Duration::from_std(window)
                    .unwrap_or_else(|_| chrono::Duration::seconds(3600));
            if ended < cutoff {
                expired_jobs.push(id.clone());
            }
        }
    }

    if expired_jobs.is_empty() {
        return;
    }

    let expired: HashSet<String> = expired_jobs.iter().cloned().collect();
    {
        let mut map = jobs.write().unwrap();
        for id in &expired_jobs {
            map.remove(id);
        }
    }
    // 级联删除：作业的任务与任务的日志分片
    let mut removed_tasks: Vec<String> = Vec::new();
    {
        let mut map = tasks.write().unwrap();
        map.retain(|task_id, cell| {
            let task = cell.lock().unwrap();
            if expired.contains(&task.job_id) {
                removed_tasks.push(task_id.clone());
                false
            } else {
                true
            }
        });
    }
    {
        let mut map = log_parts.write().unwrap();
        for task_id in &removed_tasks {
            map.remove(task_id);
        }
    }
    info!(
        "Evicted {} expired job(s) and {} task(s)",
        expired_jobs.len(),
        removed_tasks.len()
    );
}

fn create_entity<T: Clone>(
    map: &EntityMap<T>,
    id: &str,
    entity: T,
) -> EngineResult<T> {
    let mut map = map.write().unwrap();
    if map.contains_key(id) {
        return Err(EngineError::Conflict { id: id.to_string() });
    }
    map.insert(id.to_string(), Arc::new(Mutex::new(entity.clone())));
    Ok(entity)
}

fn get_entity<T: Clone>(map: &EntityMap<T>, id: &str) -> Option<T> {
    let cell = {
        let map = map.read().unwrap();
        map.get(id).cloned()
    };
    cell.map(|cell| cell.lock().unwrap().clone())
}

fn update_entity<T: Clone, F>(map: &EntityMap<T>, id: &str, mutator: F) -> Option<EngineResult<()>>
where
    F: FnOnce(&mut T) -> EngineResult<()>,
{
    let cell = {
        let map = map.read().unwrap();
        map.get(id).cloned()
    }?;
    let mut guard = cell.lock().unwrap();
    let mut copy = guard.clone();
    Some(match mutator(&mut copy) {
        Ok(()) => {
            *guard = copy;
            Ok(())
        }
        Err(e) => Err(e),
    })
}

/// 作业查询语法匹配：`tag:x`、`tags:a,b`、自由文本、空串
fn job_matches_query(job: &Job, query: &str) -> bool {
    let query = query.trim();
    if query.is_empty() {
        return true;
    }
    if let Some(tag) = query.strip_prefix("tag:") {
        return job.tags.iter().any(|t| t == tag);
    }
    if let Some(tags) = query.strip_prefix("tags:") {
        return tags
            .split(',')
            .map(str::trim)
            .any(|tag| job.tags.iter().any(|t| t == tag));
    }
    let needle = query.to_lowercase();
    job.name.to_lowercase().contains(&needle)
        || job.state.as_str().to_lowercase().contains(&needle)
}

/// 权限过滤：公开作业、创建者本人、直接授权、角色授权
fn job_visible_to(job: &Job, username: &str, user: &Option<User>, roles: &[Role]) -> bool {
    if job.permissions.is_empty() {
        return true;
    }
    if let Some(creator) = &job.created_by {
        if creator.username == username {
            return true;
        }
    }
    for permission in &job.permissions {
        if let Some(perm_user) = &permission.user {
            if perm_user.username == username {
                return true;
            }
            if let Some(user) = user {
                if !perm_user.id.is_empty() && perm_user.id == user.id {
                    return true;
                }
            }
        }
        if let Some(perm_role) = &permission.role {
            for role in roles {
                let id_match = !perm_role.id.is_empty() && perm_role.id == role.id;
                let slug_match = !perm_role.slug.is_empty() && perm_role.slug == role.slug;
                if id_match || slug_match {
                    return true;
                }
            }
        }
    }
    false
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn create_job(&self, job: &Job) -> EngineResult<Job> {
        let mut job = job.clone();
        if job.id.is_empty() {
            job.id = Uuid::new_v4().to_string();
        }
        debug!("Creating job {}", job.id);
        let id = job.id.clone();
        create_entity(&self.jobs, &id, job)
    }

    async fn get_job_by_id(&self, id: &str) -> EngineResult<Job> {
        get_entity(&self.jobs, id).ok_or_else(|| EngineError::JobNotFound { id: id.to_string() })
    }

    async fn update_job(&self, id: &str, mutator: JobMutator) -> EngineResult<()> {
        update_entity(&self.jobs, id, mutator)
            .ok_or_else(|| EngineError::JobNotFound { id: id.to_string() })?
    }

    async fn delete_job(&self, id: &str) -> EngineResult<()> {
        {
            let mut jobs = self.jobs.write().unwrap();
            if jobs.remove(id).is_none() {
                return Err(EngineError::JobNotFound { id: id.to_string() });
            }
        }
        // 级联删除任务与日志
        let mut removed_tasks = Vec::new();
        {
            let mut tasks = self.tasks.write().unwrap();
            tasks.retain(|task_id, cell| {
                let task = cell.lock().unwrap();
                if task.job_id == id {
                    removed_tasks.push(task_id.clone());
                    false
                } else {
                    true
                }
            });
        }
        let mut log_parts = self.log_parts.write().unwrap();
        for task_id in &removed_tasks {
            log_parts.remove(task_id);
        }
        debug!("Deleted job {} with {} task(s)", id, removed_tasks.len());
        Ok(())
    }

    async fn get_jobs(
        &self,
        username: &str,
        query: &str,
        page: usize,
        size: usize,
    ) -> EngineResult<Page<Job>> {
        let user = if username.is_empty() {
            None
        } else {
            self.user_by_username(username)
        };
        let roles = user
            .as_ref()
            .map(|u| self.roles_of(&u.id))
            .unwrap_or_default();

        let mut matched: Vec<Job> = {
            let map = self.jobs.read().unwrap();
            map.values()
                .map(|cell| cell.lock().unwrap().clone())
                .filter(|job| job_matches_query(job, query))
                .filter(|job| {
                    username.is_empty() || job_visible_to(job, username, &user, &roles)
                })
                .collect()
        };
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(Page::paginate(matched, page, size))
    }

    async fn create_task(&self, task: &Task) -> EngineResult<Task> {
        let mut task = task.clone();
        if task.id.is_empty() {
            task.id = Uuid::new_v4().to_string();
        }
        if task.created_at.is_none() {
            task.created_at = Some(Utc::now());
        }
        let id = task.id.clone();
        create_entity(&self.tasks, &id, task)
    }

    async fn get_task_by_id(&self, id: &str) -> EngineResult<Task> {
        get_entity(&self.tasks, id)
            .ok_or_else(|| EngineError::TaskNotFound { id: id.to_string() })
    }

    async fn update_task(&self, id: &str, mutator: TaskMutator) -> EngineResult<()> {
        update_entity(&self.tasks, id, mutator)
            .ok_or_else(|| EngineError::TaskNotFound { id: id.to_string() })?
    }

    async fn delete_task(&self, id: &str) -> EngineResult<()> {
        {
            let mut tasks = self.tasks.write().unwrap();
            if tasks.remove(id).is_none() {
                return Err(EngineError::TaskNotFound { id: id.to_string() });
            }
        }
        self.log_parts.write().unwrap().remove(id);
        Ok(())
    }

    async fn get_active_tasks(&self, job_id: &str) -> EngineResult<Vec<Task>> {
        let map = self.tasks.read().unwrap();
        Ok(map
            .values()
            .map(|cell| cell.lock().unwrap().clone())
            .filter(|task| task.job_id == job_id && task.state.is_active())
            .collect())
    }

    async fn get_next_task(&self, parent_id: &str) -> EngineResult<Task> {
        let map = self.tasks.read().unwrap();
        map.values()
            .map(|cell| cell.lock().unwrap().clone())
            .filter(|task| {
                task.parent_id.as_deref() == Some(parent_id)
                    && task.state == conveyor_domain::TaskState::Created
            })
            .min_by_key(|task| task.position)
            .ok_or_else(|| EngineError::NextTaskNotFound {
                parent_id: parent_id.to_string(),
            })
    }

    async fn create_node(&self, node: &Node) -> EngineResult<Node> {
        let mut node = node.clone();
        if node.id.is_empty() {
            node.id = Uuid::new_v4().to_string();
        }
        debug!("Registering node {} ({})", node.id, node.hostname);
        let id = node.id.clone();
        create_entity(&self.nodes, &id, node)
    }

    async fn get_node_by_id(&self, id: &str) -> EngineResult<Node> {
        get_entity(&self.nodes, id)
            .ok_or_else(|| EngineError::NodeNotFound { id: id.to_string() })
    }

    async fn update_node(&self, id: &str, mutator: NodeMutator) -> EngineResult<()> {
        update_entity(&self.nodes, id, mutator)
            .ok_or_else(|| EngineError::NodeNotFound { id: id.to_string() })?
    }

    async fn delete_node(&self, id: &str) -> EngineResult<()> {
        let mut nodes = self.nodes.write().unwrap();
        if nodes.remove(id).is_none() {
            return Err(EngineError::NodeNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn get_active_nodes(&self) -> EngineResult<Vec<Node>> {
        let map = self.nodes.read().unwrap();
        Ok(map
            .values()
            .map(|cell| cell.lock().unwrap().clone())
            .collect())
    }

    async fn create_user(&self, user: &User) -> EngineResult<User> {
        let mut user = user.clone();
        if user.id.is_empty() {
            user.id = Uuid::new_v4().to_string();
        }
        let mut users = self.users.write().unwrap();
        if users.values().any(|u| u.username == user.username) {
            return Err(EngineError::Conflict {
                id: user.username.clone(),
            });
        }
        users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&self, username: &str) -> EngineResult<User> {
        self.user_by_username(username)
            .ok_or_else(|| EngineError::UserNotFound {
                username: username.to_string(),
            })
    }

    async fn create_role(&self, role: &Role) -> EngineResult<Role> {
        let mut role = role.clone();
        if role.id.is_empty() {
            role.id = Uuid::new_v4().to_string();
        }
        let mut roles = self.roles.write().unwrap();
        if roles.values().any(|r| r.slug == role.slug) {
            return Err(EngineError::Conflict {
                id: role.slug.clone(),
            });
        }
        roles.insert(role.id.clone(), role.clone());
        Ok(role)
    }

    async fn get_role(&self, slug: &str) -> EngineResult<Role> {
        let roles = self.roles.read().unwrap();
        roles
            .values()
            .find(|r| r.slug == slug)
            .cloned()
            .ok_or_else(|| EngineError::RoleNotFound {
                slug: slug.to_string(),
            })
    }

    async fn get_roles(&self) -> EngineResult<Vec<Role>> {
        let roles = self.roles.read().unwrap();
        let mut all: Vec<Role> = roles.values().cloned().collect();
        all.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(all)
    }

    async fn assign_role(&self, user_id: &str, role_id: &str) -> EngineResult<()> {
        let mut user_roles = self.user_roles.write().unwrap();
        user_roles
            .entry(user_id.to_string())
            .or_default()
            .insert(role_id.to_string());
        Ok(())
    }

    async fn unassign_role(&self, user_id: &str, role_id: &str) -> EngineResult<()> {
        let mut user_roles = self.user_roles.write().unwrap();
        if let Some(assigned) = user_roles.get_mut(user_id) {
            assigned.remove(role_id);
        }
        Ok(())
    }

    async fn get_user_roles(&self, user_id: &str) -> EngineResult<Vec<Role>> {
        Ok(self.roles_of(user_id))
    }

    async fn create_task_log_part(&self, part: &TaskLogPart) -> EngineResult<TaskLogPart> {
        let mut part = part.clone();
        if part.created_at.is_none() {
            part.created_at = Some(Utc::now());
        }
        let mut map = self.log_parts.write().unwrap();
        let parts = map.entry(part.task_id.clone()).or_default();
        if part.number == 0 {
            part.number = parts.iter().map(|p| p.number).max().unwrap_or(0) + 1;
        }
        parts.push(part.clone());
        Ok(part)
    }

    async fn get_task_log_parts(
        &self,
        task_id: &str,
        contains: &str,
        page: usize,
        size: usize,
    ) -> EngineResult<Page<TaskLogPart>> {
        let mut parts: Vec<TaskLogPart> = {
            let map = self.log_parts.read().unwrap();
            map.get(task_id).cloned().unwrap_or_default()
        };
        if !contains.is_empty() {
            let needle = contains.to_lowercase();
            parts.retain(|p| p.contents.to_lowercase().contains(&needle));
        }
        parts.sort_by(|a, b| b.number.cmp(&a.number));
        Ok(Page::paginate(parts, page, size))
    }

    async fn get_job_log_parts(
        &self,
        job_id: &str,
        contains: &str,
        page: usize,
        size: usize,
    ) -> EngineResult<Page<TaskLogPart>> {
        let task_ids: Vec<String> = {
            let map = self.tasks.read().unwrap();
            map.values()
                .map(|cell| cell.lock().unwrap().clone())
                .filter(|task| task.job_id == job_id)
                .map(|task| task.id)
                .collect()
        };
        let mut parts: Vec<TaskLogPart> = {
            let map = self.log_parts.read().unwrap();
            task_ids
                .iter()
                .flat_map(|task_id| map.get(task_id).cloned().unwrap_or_default())
                .collect()
        };
        if !contains.is_empty() {
            let needle = contains.to_lowercase();
            parts.retain(|p| p.contents.to_lowercase().contains(&needle));
        }
        parts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.number.cmp(&a.number))
        });
        if parts.is_empty() {
            warn!("Job {} has no log parts", job_id);
        }
        Ok(Page::paginate(parts, page, size))
    }
}
