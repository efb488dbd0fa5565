use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::prelude::*;
use verifycopy_lib::config::ConfigSection;
use verifycopy_lib::core::{OperationOutcome, TimingTracker};
use verifycopy_lib::logging::{default_config_dir, get_log_dir, LogConfig, SizeRotatingWriter};
use uuid::Uuid;
use verifycopy_lib::models::Stage;
use verifycopy_lib::{
    data_dir, AppServices, ExecuteRequest, LabelingSettings, ProgressEvent, VerificationPolicy,
};

/// 复制文件到一个或多个目标并校验
#[derive(Parser, Debug)]
#[command(name = "verifycopy")]
#[command(version)]
#[command(about = "Copy a folder to one or more destinations and verify every file")]
struct Args {
    /// 源目录
    #[arg(value_name = "SOURCE", required_unless_present_any = ["resume", "discard"])]
    source: Option<PathBuf>,

    /// 目标目录（可多个）
    #[arg(value_name = "DEST", required_unless_present_any = ["resume", "discard"])]
    destinations: Vec<PathBuf>,

    /// 继续上次暂停的操作（操作 ID）
    #[arg(long, value_name = "ID", conflicts_with_all = ["discard", "source"])]
    resume: Option<Uuid>,

    /// 放弃上次暂停的操作（操作 ID）
    #[arg(long, value_name = "ID", conflicts_with = "source")]
    discard: Option<Uuid>,

    /// 校验策略: size-only, standard, thorough, paranoid
    #[arg(long, value_name = "POLICY", default_value = "standard")]
    policy: VerificationPolicy,

    /// 目标子目录前缀
    #[arg(long)]
    prefix: Option<String>,

    /// 目标子目录后缀
    #[arg(long)]
    suffix: Option<String>,

    /// 在目标子目录名后追加日期
    #[arg(long)]
    append_date: bool,

    /// 自定义目标子目录名（默认使用源目录名）
    #[arg(long)]
    folder_name: Option<String>,

    /// 预估吞吐量（MB/s），用于开始前的耗时估算
    #[arg(long, value_name = "MBPS")]
    estimate_mbps: Option<u64>,
}

/// 初始化日志系统
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = get_log_dir();
    let _ = std::fs::create_dir_all(&log_dir);

    let config = LogConfig::load(&data_dir(&default_config_dir()));

    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    // 创建日志级别过滤器
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level().into());

    let Ok(file_writer) = SizeRotatingWriter::new(&log_dir, config.max_size_mb) else {
        // 文件日志创建失败，回退到控制台
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        return None;
    };

    let (writer, guard) = tracing_appender::non_blocking(file_writer.writer());
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    // 在 debug 模式下也输出到控制台
    #[cfg(debug_assertions)]
    {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false);
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    // 在 release 模式下只输出到文件
    #[cfg(not(debug_assertions))]
    {
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    Some(guard)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

fn source_bytes(root: &std::path::Path) -> u64 {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let _log_guard = init_logging();

    let services = AppServices::new(&data_dir(&default_config_dir())).await?;

    if let Some(id) = args.discard {
        let known = services.pending_operations().iter().any(|s| s.operation_id == id);
        let code = if known {
            services.discard_operation(id)?;
            println!("已放弃操作: {}", id);
            ExitCode::SUCCESS
        } else {
            eprintln!("没有找到暂停的操作: {}", id);
            ExitCode::FAILURE
        };
        services.cleanup();
        return Ok(code);
    }

    let mut request = match (args.resume, args.source) {
        (Some(id), _) => {
            let Some(request) = services.resume_request(id) else {
                eprintln!("没有找到暂停的操作: {}", id);
                services.cleanup();
                return Ok(ExitCode::FAILURE);
            };
            println!("继续操作 {}（已处理 {} 项）", id, request.resume_after);
            request
        }
        (None, Some(source)) => {
            let pending = services.pending_operations();
            if !pending.is_empty() {
                println!("有 {} 个上次暂停的操作未完成（--resume 继续，--discard 放弃）:", pending.len());
                for saved in &pending {
                    println!(
                        "  {} {:?} ({:.0}%, {:?})",
                        saved.operation_id,
                        saved.context.source_root,
                        saved.progress.fraction * 100.0,
                        saved.reason
                    );
                }
            }

            let labeling = LabelingSettings {
                folder_name: args.folder_name,
                prefix: args.prefix,
                suffix: args.suffix,
                append_date: args.append_date,
            };
            ExecuteRequest::new(source, args.destinations)
                .with_policy(args.policy)
                .with_labeling(labeling)
        }
        (None, None) => {
            services.cleanup();
            return Ok(ExitCode::FAILURE);
        }
    };

    if let Some(mbps) = args.estimate_mbps {
        let thorough = services.config.engine.thorough_algorithms.len();
        let total = source_bytes(&request.source_root);
        if let Some(estimate) =
            TimingTracker::estimate_duration(total, request.policy, thorough, mbps * 1024 * 1024)
        {
            println!(
                "预计耗时: {}s（{}，每个目标）",
                estimate.as_secs(),
                format_bytes(total)
            );
        }
    }

    let operation_id = *request.operation_id.get_or_insert_with(Uuid::new_v4);

    // 第一次 Ctrl-C 暂停（进度写入快照），第二次退出进程；无法暂停时取消
    let engine = services.engine.clone();
    let (quit_tx, quit_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        if engine.pause().is_err() {
            eprintln!("正在取消...");
            engine.cancel();
            return;
        }
        eprintln!(
            "已暂停，再按 Ctrl-C 退出，之后可用 --resume {} 继续",
            operation_id
        );
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = quit_tx.send(());
        }
    });

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            if event.stage == Stage::Copying {
                continue;
            }
            println!(
                "[{:>5.1}%] {}/{} {} {}/s{}",
                event.fraction * 100.0,
                event.files_processed,
                event.files_total,
                event.current_file,
                format_bytes(event.bytes_per_second),
                event
                    .eta_seconds
                    .map(|s| format!(" 剩余 {}s", s))
                    .unwrap_or_default()
            );
        }
    });

    let result = tokio::select! {
        result = services.engine.execute(request, Some(progress_tx), None) => Some(result),
        Ok(()) = quit_rx => None,
    };
    let _ = printer.await;
    services.cleanup();

    let Some(result) = result else {
        println!("进度已保存: {}", operation_id);
        return Ok(ExitCode::from(130));
    };

    let operation = match result {
        Ok(operation) => operation,
        Err(e) => {
            eprintln!("操作失败: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    println!(
        "完成: 成功 {} 失败 {}，{}，耗时 {:.1}s，平均 {}/s",
        operation.succeeded_count(),
        operation.failed_count(),
        format_bytes(operation.total_bytes()),
        operation.timing.elapsed_ms as f64 / 1000.0,
        format_bytes(operation.timing.average_bytes_per_second)
    );
    for row in operation.results.iter().filter(|r| !r.success) {
        println!(
            "  失败: {} -> {} ({})",
            row.path,
            row.destination,
            row.error.as_deref().unwrap_or("-")
        );
    }
    for report in &operation.errors.reports {
        for action in &report.recovery_actions {
            tracing::debug!("{}: {}", report.message, action.description());
        }
    }

    let code = match operation.errors.outcome() {
        OperationOutcome::Passed => {
            println!("结论: 全部通过");
            ExitCode::SUCCESS
        }
        OperationOutcome::PassedWithWarnings => {
            println!("结论: 通过（有警告）");
            ExitCode::SUCCESS
        }
        OperationOutcome::Failed if operation.cancelled => {
            println!("结论: 已取消");
            ExitCode::from(130)
        }
        OperationOutcome::Failed => {
            println!("结论: 未通过");
            ExitCode::FAILURE
        }
    };
    Ok(code)
}
