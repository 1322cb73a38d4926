//! 提交校验
//!
//! 逐字段校验提交结构，错误以 `Validation` 变体返回。

use conveyor_domain::{is_reserved_queue, parse_duration};
use conveyor_errors::{EngineError, EngineResult};

use crate::job::JobInput;
use crate::task::{AuxTaskInput, TaskInput};

const MAX_VAR_LEN: usize = 64;
const MAX_WORKDIR_LEN: usize = 256;
const MAX_RETRY_LIMIT: u32 = 10;
const MAX_PRIORITY: u8 = 9;
const MAX_EACH_CONCURRENCY: usize = 99_999;

/// 校验作业提交
pub fn validate_job(job: &JobInput) -> EngineResult<()> {
    if job.name.trim().is_empty() {
        return Err(EngineError::validation("作业名称不能为空"));
    }
    if job.tasks.is_empty() {
        return Err(EngineError::validation("作业必须至少包含一个任务"));
    }
    for permission in &job.permissions {
        match (&permission.user, &permission.role) {
            (Some(_), Some(_)) => {
                return Err(EngineError::validation(
                    "单条权限只能指向用户或角色之一",
                ))
            }
            (None, None) => {
                return Err(EngineError::validation("权限必须指向用户或角色"))
            }
            _ => {}
        }
    }
    if let Some(auto_delete) = &job.auto_delete {
        parse_duration(&auto_delete.after)?;
    }
    for task in &job.tasks {
        validate_task(task)?;
    }
    Ok(())
}

/// 校验单个任务提交（递归校验结构化子任务）
pub fn validate_task(task: &TaskInput) -> EngineResult<()> {
    if task.name.trim().is_empty() {
        return Err(EngineError::validation("任务名称不能为空"));
    }

    let structural =
        [task.parallel.is_some(), task.each.is_some(), task.subjob.is_some()]
            .iter()
            .filter(|set| **set)
            .count();
    if structural > 1 {
        return Err(EngineError::validation(format!(
            "任务 {} 的 parallel / each / subjob 只能出现一个",
            task.name
        )));
    }
    if structural == 1 && has_container_spec(task) {
        return Err(EngineError::validation(format!(
            "任务 {} 的结构化形式不能与容器规格同时出现",
            task.name
        )));
    }

    if let Some(retry) = &task.retry {
        if retry.limit == 0 || retry.limit > MAX_RETRY_LIMIT {
            return Err(EngineError::validation(format!(
                "任务 {} 的重试上限必须在 1 到 {MAX_RETRY_LIMIT} 之间",
                task.name
            )));
        }
    }
    if task.priority > MAX_PRIORITY {
        return Err(EngineError::validation(format!(
            "任务 {} 的优先级不能超过 {MAX_PRIORITY}",
            task.name
        )));
    }
    if let Some(var) = &task.var {
        if var.len() > MAX_VAR_LEN {
            return Err(EngineError::validation(format!(
                "任务 {} 的 var 名称不能超过 {MAX_VAR_LEN} 字符",
                task.name
            )));
        }
    }
    if let Some(workdir) = &task.workdir {
        if workdir.len() > MAX_WORKDIR_LEN {
            return Err(EngineError::validation(format!(
                "任务 {} 的 workdir 不能超过 {MAX_WORKDIR_LEN} 字符",
                task.name
            )));
        }
    }
    if let Some(queue) = &task.queue {
        if is_reserved_queue(queue) {
            return Err(EngineError::validation(format!(
                "任务 {} 的队列名 {queue} 为引擎保留",
                task.name
            )));
        }
    }
    if let Some(timeout) = &task.timeout {
        parse_duration(timeout)?;
    }
    for mount in &task.mounts {
        if mount.target.trim().is_empty() {
            return Err(EngineError::validation(format!(
                "任务 {} 的挂载缺少 target",
                task.name
            )));
        }
    }

    if let Some(parallel) = &task.parallel {
        if parallel.tasks.is_empty() {
            return Err(EngineError::validation(format!(
                "任务 {} 的 parallel.tasks 不能为空",
                task.name
            )));
        }
        for sub in &parallel.tasks {
            validate_task(sub)?;
        }
    }
    if let Some(each) = &task.each {
        if each.list.trim().is_empty() {
            return Err(EngineError::validation(format!(
                "任务 {} 的 each.list 不能为空",
                task.name
            )));
        }
        let sub = each.task.as_ref().ok_or_else(|| {
            EngineError::validation(format!("任务 {} 的 each.task 不能为空", task.name))
        })?;
        if each.concurrency > MAX_EACH_CONCURRENCY {
            return Err(EngineError::validation(format!(
                "任务 {} 的 each.concurrency 不能超过 {MAX_EACH_CONCURRENCY}",
                task.name
            )));
        }
        validate_task(sub)?;
    }
    if let Some(subjob) = &task.subjob {
        if subjob.name.trim().is_empty() {
            return Err(EngineError::validation(format!(
                "任务 {} 的子作业名称不能为空",
                task.name
            )));
        }
        if subjob.tasks.is_empty() {
            return Err(EngineError::validation(format!(
                "任务 {} 的子作业必须至少包含一个任务",
                task.name
            )));
        }
        for sub in &subjob.tasks {
            validate_task(sub)?;
        }
    }

    for aux in task.pre.iter().chain(task.post.iter()).chain(task.sidecars.iter()) {
        validate_aux_task(task, aux)?;
    }

    Ok(())
}

fn validate_aux_task(parent: &TaskInput, aux: &AuxTaskInput) -> EngineResult<()> {
    if aux.name.trim().is_empty() {
        return Err(EngineError::validation(format!(
            "任务 {} 的前置/后置任务名称不能为空",
            parent.name
        )));
    }
    if let Some(timeout) = &aux.timeout {
        parse_duration(timeout)?;
    }
    Ok(())
}

fn has_container_spec(task: &TaskInput) -> bool {
    !task.image.is_empty()
        || !task.run.is_empty()
        || !task.cmd.is_empty()
        || !task.entrypoint.is_empty()
}
