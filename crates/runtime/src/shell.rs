use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use conveyor_domain::Task;
use conveyor_errors::{EngineError, EngineResult};

use crate::filter::filter_control_bytes;
use crate::TaskRuntime;

/// 结果快照的默认上限
const DEFAULT_MAX_RESULT_BYTES: usize = 4096;
/// 快照截断标记
const TRUNCATION_SENTINEL: &str = "\n...[truncated]";

/// 本地进程运行时
///
/// 以 `sh -c` 运行任务的 `run` 脚本（或 `cmd` 拼接），应用环境
/// 变量与工作目录，逐行流式输出日志。标准输出的结果快照有上限，
/// 超出部分以截断标记结尾；完整输出始终进入日志流。
pub struct ShellRuntime {
    /// 运行中任务的进程 ID，用于取消
    processes: Arc<RwLock<HashMap<String, u32>>>,
    max_result_bytes: usize,
}

impl ShellRuntime {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }

    pub fn with_result_limit(max_result_bytes: usize) -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            max_result_bytes,
        }
    }

    fn script_of(task: &Task) -> EngineResult<String> {
        if !task.run.is_empty() {
            return Ok(task.run.clone());
        }
        if !task.cmd.is_empty() {
            return Ok(task.cmd.join(" "));
        }
        Err(EngineError::validation(format!(
            "任务 {} 没有可执行的 run 或 cmd",
            task.id
        )))
    }
}

impl Default for ShellRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRuntime for ShellRuntime {
    async fn run(
        &self,
        task: &Task,
        logs: mpsc::UnboundedSender<String>,
    ) -> EngineResult<String> {
        let script = Self::script_of(task)?;
        debug!("Running task {}: {}", task.id, script);

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&script)
            .envs(&task.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(workdir) = &task.workdir {
            if !workdir.is_empty() {
                command.current_dir(workdir);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::execution(format!("启动任务 {} 失败: {e}", task.id)))?;

        if let Some(pid) = child.id() {
            self.processes.write().await.insert(task.id.clone(), pid);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::execution("无法获取任务的标准输出"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::execution("无法获取任务的标准错误"))?;

        let mut capture = String::new();
        let mut truncated = false;

        let stdout_logs = logs.clone();
        let stdout_reader = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let clean = filter_control_bytes(&line);
                if capture.len() + clean.len() < self.max_result_bytes {
                    if !capture.is_empty() {
                        capture.push('\n');
                    }
                    capture.push_str(&clean);
                } else {
                    truncated = true;
                }
                let _ = stdout_logs.send(clean);
            }
        };
        let stderr_reader = async {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = logs.send(filter_control_bytes(&line));
            }
        };
        tokio::join!(stdout_reader, stderr_reader);

        let status = child
            .wait()
            .await
            .map_err(|e| EngineError::execution(format!("等待任务 {} 结束失败: {e}", task.id)));
        // 无论哪条退出路径都清除进程登记
        self.processes.write().await.remove(&task.id);
        let status = status?;

        if truncated {
            capture.push_str(TRUNCATION_SENTINEL);
        }

        match status.code() {
            Some(0) => {
                debug!("Task {} completed", task.id);
                Ok(capture)
            }
            Some(code) => Err(EngineError::NonZeroExit {
                code,
                output: capture,
            }),
            // 被信号终止，视为取消
            None => Err(EngineError::Cancelled),
        }
    }

    async fn stop(&self, task: &Task) -> EngineResult<()> {
        let pid = { self.processes.write().await.remove(&task.id) };
        let Some(pid) = pid else {
            return Ok(());
        };
        info!("Stopping task {} (pid {})", task.id, pid);

        #[cfg(unix)]
        {
            match std::process::Command::new("kill")
                .arg(pid.to_string())
                .output()
            {
                Ok(output) if output.status.success() => Ok(()),
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!("Failed to kill pid {}: {}", pid, stderr);
                    Err(EngineError::execution(format!(
                        "终止任务 {} 失败: {stderr}",
                        task.id
                    )))
                }
                Err(e) => Err(EngineError::execution(format!(
                    "终止任务 {} 失败: {e}",
                    task.id
                ))),
            }
        }
        #[cfg(not(unix))]
        {
            warn!("Task cancellation is only supported on unix, pid {}", pid);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_run(run: &str) -> Task {
        Task {
            id: uuid_like(),
            run: run.to_string(),
            ..Task::default()
        }
    }

    fn uuid_like() -> String {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!("test-task-{}", COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let rt = ShellRuntime::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = rt.run(&task_with_run("echo hello"), tx).await.unwrap();
        assert_eq!(result, "hello");
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_run_applies_env() {
        let rt = ShellRuntime::new();
        let mut task = task_with_run("echo $GREETING");
        task.env
            .insert("GREETING".to_string(), "ni hao".to_string());
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = rt.run(&task, tx).await.unwrap();
        assert_eq!(result, "ni hao");
    }

    #[tokio::test]
    async fn test_run_falls_back_to_cmd() {
        let rt = ShellRuntime::new();
        let task = Task {
            id: uuid_like(),
            cmd: vec!["echo".to_string(), "from-cmd".to_string()],
            ..Task::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = rt.run(&task, tx).await.unwrap();
        assert_eq!(result, "from-cmd");
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_code_and_output() {
        let rt = ShellRuntime::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = rt
            .run(&task_with_run("echo boom; exit 3"), tx)
            .await
            .unwrap_err();
        match err {
            EngineError::NonZeroExit { code, output } => {
                assert_eq!(code, 3);
                assert_eq!(output, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_task_is_rejected() {
        let rt = ShellRuntime::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = rt.run(&Task::default(), tx).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_result_snapshot_is_bounded() {
        let rt = ShellRuntime::with_result_limit(64);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = rt
            .run(&task_with_run("i=0; while [ $i -lt 50 ]; do echo line-$i; i=$((i+1)); done"), tx)
            .await
            .unwrap();
        assert!(result.len() < 64 + TRUNCATION_SENTINEL.len() + 16);
        assert!(result.ends_with(TRUNCATION_SENTINEL));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_cancels_running_task() {
        let rt = Arc::new(ShellRuntime::new());
        let task = task_with_run("sleep 30");
        let (tx, _rx) = mpsc::unbounded_channel();

        let runner = rt.clone();
        let run_task = task.clone();
        let handle = tokio::spawn(async move { runner.run(&run_task, tx).await });

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        rt.stop(&task).await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_stop_unknown_task_is_noop() {
        let rt = ShellRuntime::new();
        assert!(rt.stop(&task_with_run("echo hi")).await.is_ok());
    }

    #[tokio::test]
    async fn test_stderr_streams_to_logs() {
        let rt = ShellRuntime::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = rt
            .run(&task_with_run("echo warn >&2; echo out"), tx)
            .await
            .unwrap();
        assert_eq!(result, "out");
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        assert!(lines.contains(&"warn".to_string()));
        assert!(lines.contains(&"out".to_string()));
    }
}
