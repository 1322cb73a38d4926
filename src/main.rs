use std::time::Duration;

use clap::{Arg, ArgMatches, Command};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use conveyor::{Engine, EngineConfig, EngineMode, ShutdownManager};
use conveyor_domain::JobState;
use conveyor_input::JobInput;

/// 退出码约定：0 成功，1 配置错误，2 运行失败，3 已取消
const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_RUNTIME: i32 = 2;
const EXIT_CANCELLED: i32 = 3;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let matches = Command::new("conveyor")
        .version("0.1.0")
        .about("分布式容器化工作流引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .default_value("config/conveyor.toml")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty")
                .global(true),
        )
        .subcommand(
            Command::new("serve").about("启动引擎").arg(
                Arg::new("mode")
                    .short('m')
                    .long("mode")
                    .value_name("MODE")
                    .help("运行模式")
                    .value_parser(["standalone", "coordinator", "worker"])
                    .default_value("standalone"),
            ),
        )
        .subcommand(
            Command::new("run")
                .about("提交 JSON 作业文件并等待其结束")
                .arg(
                    Arg::new("file")
                        .short('f')
                        .long("file")
                        .value_name("FILE")
                        .help("作业文件路径")
                        .required(true),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .value_name("DURATION")
                        .help("等待作业结束的上限")
                        .default_value("1h"),
                ),
        )
        .get_matches();

    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    let log_format = matches
        .get_one::<String>("log-format")
        .map(String::as_str)
        .unwrap_or("pretty");
    if let Err(e) = init_logging(log_level, log_format) {
        eprintln!("初始化日志失败: {e}");
        return EXIT_CONFIG;
    }

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = match EngineConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("加载配置失败: {}", e);
            return EXIT_CONFIG;
        }
    };

    match matches.subcommand() {
        Some(("serve", sub)) => {
            let mode = match sub
                .get_one::<String>("mode")
                .map(String::as_str)
                .unwrap_or("standalone")
            {
                "coordinator" => EngineMode::Coordinator,
                "worker" => EngineMode::Worker,
                _ => EngineMode::Standalone,
            };
            serve(&config, mode).await
        }
        Some(("run", sub)) => run_job(&config, sub).await,
        _ => serve(&config, EngineMode::Standalone).await,
    }
}

async fn serve(config: &EngineConfig, mode: EngineMode) -> i32 {
    let engine = match Engine::start(config, mode).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("引擎启动失败: {}", e);
            return EXIT_RUNTIME;
        }
    };
    info!("引擎已启动，等待作业");

    let shutdown = ShutdownManager::new();
    wait_for_signal().await;
    info!("收到关闭信号，开始优雅关闭");
    shutdown.shutdown().await;
    if let Err(e) = engine.stop().await {
        error!("关闭引擎时出错: {}", e);
        return EXIT_RUNTIME;
    }
    EXIT_OK
}

async fn run_job(config: &EngineConfig, matches: &ArgMatches) -> i32 {
    let Some(file) = matches.get_one::<String>("file") else {
        error!("缺少作业文件参数");
        return EXIT_CONFIG;
    };
    let raw = match std::fs::read_to_string(file) {
        Ok(raw) => raw,
        Err(e) => {
            error!("读取作业文件 {} 失败: {}", file, e);
            return EXIT_CONFIG;
        }
    };
    let input: JobInput = match serde_json::from_str(&raw) {
        Ok(input) => input,
        Err(e) => {
            error!("解析作业文件 {} 失败: {}", file, e);
            return EXIT_CONFIG;
        }
    };
    let timeout = matches
        .get_one::<String>("timeout")
        .map(String::as_str)
        .unwrap_or("1h");
    let timeout = match conveyor_domain::parse_duration(timeout) {
        Ok(timeout) => timeout,
        Err(e) => {
            error!("无效的超时参数: {}", e);
            return EXIT_CONFIG;
        }
    };

    let engine = match Engine::start(config, EngineMode::Standalone).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("引擎启动失败: {}", e);
            return EXIT_RUNTIME;
        }
    };

    let job = match engine.submit_job(&input).await {
        Ok(job) => job,
        Err(e) => {
            error!("提交作业失败: {}", e);
            return EXIT_CONFIG;
        }
    };

    let finished = tokio::select! {
        result = engine.wait_for_job(&job.id, timeout) => result,
        _ = wait_for_signal() => {
            info!("收到中断信号，取消作业 {}", job.id);
            if let Err(e) = engine.cancel_job(&job.id).await {
                error!("取消作业失败: {}", e);
            }
            engine.wait_for_job(&job.id, Duration::from_secs(10)).await
        }
    };

    let code = match finished {
        Ok(job) => match job.state {
            JobState::Completed => {
                info!("作业 {} 完成", job.id);
                EXIT_OK
            }
            JobState::Cancelled => {
                info!("作业 {} 已取消", job.id);
                EXIT_CANCELLED
            }
            other => {
                error!(
                    "作业 {} 以 {:?} 结束: {}",
                    job.id,
                    other,
                    job.error.as_deref().unwrap_or("未知错误")
                );
                EXIT_RUNTIME
            }
        },
        Err(e) => {
            error!("等待作业结束失败: {}", e);
            EXIT_RUNTIME
        }
    };
    let _ = engine.stop().await;
    code
}

fn init_logging(log_level: &str, log_format: &str) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);
    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| e.to_string()),
        _ => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| e.to_string()),
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到 Ctrl+C 信号");
        },
        _ = terminate => {
            info!("收到 SIGTERM 信号");
        },
    }
}
