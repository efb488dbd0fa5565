use crate::core::gate::AsyncGate;
use crate::core::hasher::FileHasher;
use crate::core::ledger::{ResultsLedger, DEFAULT_MEMORY_CAP};
use crate::core::reporting::{ErrorContext, ErrorReportingService, OperationOutcome};
use crate::core::state::{
    OperationContext, OperationState, OperationStateService, PauseProgress, PauseReason,
    SavedOperationState,
};
use crate::core::timing::TimingTracker;
use crate::error::{CoreError, CoreResult};
use crate::models::{
    DigestAlgorithm, FileOperation, FileOperationResult, LabelingSettings, ProgressEvent,
    ResultRow, Stage, VerificationMethod, VerificationPolicy, VerificationResult,
};
use crate::platform::PlatformManager;
use crate::storage::{AccessMode, FileSystemService};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 同时进行的摘要/比较任务数
    pub max_concurrent_hashes: usize,
    pub standard_algorithm: DigestAlgorithm,
    pub thorough_algorithms: Vec<DigestAlgorithm>,
    /// 结果溢出日志所在目录
    pub ledger_dir: PathBuf,
    pub ledger_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_hashes: 2,
            standard_algorithm: DigestAlgorithm::Sha256,
            thorough_algorithms: vec![DigestAlgorithm::Md5, DigestAlgorithm::Sha256],
            ledger_dir: std::env::temp_dir().join("verifycopy"),
            ledger_capacity: DEFAULT_MEMORY_CAP,
        }
    }
}

/// 一次操作的输入
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// 为空时生成新的操作 ID
    pub operation_id: Option<Uuid>,
    pub source_root: PathBuf,
    pub destination_roots: Vec<PathBuf>,
    pub policy: VerificationPolicy,
    pub labeling: LabelingSettings,
    /// 上次运行已经处理过的 (文件, 目标) 数量，按处理顺序计
    pub resume_after: u64,
}

impl ExecuteRequest {
    pub fn new(source_root: impl Into<PathBuf>, destination_roots: Vec<PathBuf>) -> Self {
        Self {
            operation_id: None,
            source_root: source_root.into(),
            destination_roots,
            policy: VerificationPolicy::default(),
            labeling: LabelingSettings::default(),
            resume_after: 0,
        }
    }

    pub fn with_policy(mut self, policy: VerificationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_labeling(mut self, labeling: LabelingSettings) -> Self {
        self.labeling = labeling;
        self
    }

    /// 从上次进程留下的暂停快照重建请求，沿用原操作 ID。
    ///
    /// 已处理过的组合如果目标文件的大小和修改时间仍与源文件一致则跳过复制，
    /// 摘要从缓存读取，不再重新读盘。
    pub fn from_saved(saved: &SavedOperationState) -> Self {
        Self {
            operation_id: Some(saved.operation_id),
            source_root: saved.context.source_root.clone(),
            destination_roots: saved.context.destination_roots.clone(),
            policy: saved.context.policy,
            labeling: saved.context.labeling.clone(),
            resume_after: saved.progress.files_processed,
        }
    }
}

/// 单次运行的可变上下文
struct Run<'a> {
    id: Uuid,
    policy: VerificationPolicy,
    cancel: CancellationToken,
    progress_tx: Option<&'a UnboundedSender<ProgressEvent>>,
    result_tx: Option<&'a UnboundedSender<FileOperationResult>>,
    timing: TimingTracker,
    ledger: ResultsLedger,
    errors: ErrorReportingService,
    processed: u64,
    total: u64,
    /// 源文件枚举完成后才知道总数
    enumerated: bool,
    resume_after: u64,
}

impl Run<'_> {
    fn fraction(&self) -> f64 {
        if self.total == 0 {
            if self.enumerated {
                1.0
            } else {
                0.0
            }
        } else {
            (self.processed as f64 / self.total as f64).min(1.0)
        }
    }

    fn emit(&self, stage: Stage, current_file: &str, destination: Option<&Path>) {
        let Some(tx) = self.progress_tx else {
            return;
        };
        let event = ProgressEvent {
            operation_id: self.id,
            fraction: self.fraction(),
            files_processed: self.processed,
            files_total: self.total,
            current_file: current_file.to_string(),
            destination: destination.map(Path::to_path_buf),
            stage,
            bytes_per_second: self.timing.current_bps(),
            eta_seconds: self
                .timing
                .eta(self.total.saturating_sub(self.processed))
                .map(|d| d.as_secs()),
        };
        let _ = tx.send(event);
    }

    fn send_result(&self, result: &FileOperationResult) {
        if let Some(tx) = self.result_tx {
            let _ = tx.send(result.clone());
        }
    }
}

/// 复制校验引擎
pub struct CopyVerifyEngine {
    fs: Arc<dyn FileSystemService>,
    hasher: FileHasher,
    gate: AsyncGate,
    state: Arc<OperationStateService>,
    platform: Arc<dyn PlatformManager>,
    config: EngineConfig,
    cancel: Mutex<CancellationToken>,
}

impl CopyVerifyEngine {
    pub fn new(
        fs: Arc<dyn FileSystemService>,
        hasher: FileHasher,
        state: Arc<OperationStateService>,
        platform: Arc<dyn PlatformManager>,
        config: EngineConfig,
    ) -> Self {
        Self {
            fs,
            hasher,
            gate: AsyncGate::new(config.max_concurrent_hashes),
            state,
            platform,
            config,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn state(&self) -> &Arc<OperationStateService> {
        &self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 取消当前操作，在下一个文件或数据块边界生效
    pub fn cancel(&self) {
        info!("请求取消操作");
        self.token().cancel();
    }

    /// 用户暂停，在下一个文件边界生效
    pub fn pause(&self) -> CoreResult<()> {
        self.state.pause(PauseReason::UserRequested).map(|_| ())
    }

    pub fn resume(&self) -> CoreResult<()> {
        self.state.resume()
    }

    /// 执行一次完整的复制校验
    pub async fn execute(
        &self,
        request: ExecuteRequest,
        progress_tx: Option<UnboundedSender<ProgressEvent>>,
        result_tx: Option<UnboundedSender<FileOperationResult>>,
    ) -> CoreResult<FileOperation> {
        let id = request.operation_id.unwrap_or_else(Uuid::new_v4);
        let started_at = Utc::now();

        // 重置取消令牌
        let cancel = {
            let mut guard = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            *guard = CancellationToken::new();
            guard.clone()
        };

        self.state.start(
            id,
            OperationContext {
                source_root: request.source_root.clone(),
                destination_roots: request.destination_roots.clone(),
                policy: request.policy,
                labeling: request.labeling.clone(),
            },
        )?;

        info!(
            "开始复制校验: {} ({:?} -> {} 个目标, 策略 {})",
            id,
            request.source_root,
            request.destination_roots.len(),
            request.policy
        );

        let mut run = Run {
            id,
            policy: request.policy,
            cancel,
            progress_tx: progress_tx.as_ref(),
            result_tx: result_tx.as_ref(),
            timing: TimingTracker::new(),
            ledger: ResultsLedger::with_capacity(
                self.config.ledger_dir.join(format!("{}.ndjson", id)),
                self.config.ledger_capacity,
            ),
            errors: ErrorReportingService::new(id),
            processed: 0,
            total: 0,
            enumerated: false,
            resume_after: request.resume_after,
        };
        run.timing.start();
        run.timing.enter_stage(Stage::Preparing);
        run.emit(Stage::Preparing, "", None);

        let mut cancelled = false;
        let files = match self.prepare(&request, &run).await {
            Ok(files) => files,
            Err(e) if e.is_cancelled() => {
                cancelled = true;
                Vec::new()
            }
            Err(e) => return Err(self.abort(&mut run, e)),
        };
        run.total = files.len() as u64 * request.destination_roots.len() as u64;
        run.enumerated = !cancelled;
        if run.resume_after > 0 {
            info!("恢复上次的操作，已处理 {}/{}", run.resume_after, run.total);
        }

        let folder_name = request.labeling.folder_name(&request.source_root, started_at);
        let destinations: &[PathBuf] = if cancelled {
            &[]
        } else {
            &request.destination_roots
        };

        'destinations: for destination_root in destinations {
            let folder = destination_root.join(&folder_name);
            if let Err(e) = self.fs.create_directory(&folder).await {
                warn!("无法创建目标目录 {:?}: {}", folder, e);
                run.errors.report(&e, ErrorContext::file(&folder).with_stage(Stage::Preparing));
                for relative in &files {
                    if run.cancel.is_cancelled() {
                        cancelled = true;
                        break 'destinations;
                    }
                    let result = self.failed_result(
                        &run,
                        &request.source_root,
                        destination_root,
                        &folder,
                        relative,
                        &e,
                        0,
                    );
                    if let Err(ledger_err) = self.record(&mut run, result) {
                        return Err(self.abort(&mut run, ledger_err));
                    }
                    run.processed += 1;
                    run.emit(Stage::Copying, &normalize(relative), Some(destination_root));
                }
                continue;
            }

            for relative in &files {
                if self.checkpoint(&mut run).await.is_err() {
                    cancelled = true;
                    break 'destinations;
                }

                match self
                    .process_file(&mut run, &request.source_root, destination_root, &folder, relative)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {
                        cancelled = true;
                        break 'destinations;
                    }
                    Err(e) => return Err(self.abort(&mut run, e)),
                }
            }
        }

        // 取消可能发生在最后一个文件完成之后
        cancelled |= run.cancel.is_cancelled() && run.processed < run.total;

        run.timing.finish();
        if cancelled {
            info!("操作已取消: {} ({}/{})", id, run.processed, run.total);
            run.errors.report(&CoreError::Cancelled, ErrorContext::default());
            if let Err(e) = self.state.cancel() {
                warn!("更新取消状态失败: {}", e);
            }
        } else {
            run.emit(Stage::Completed, "", None);
            if let Err(e) = self.state.complete() {
                warn!("更新完成状态失败: {}", e);
            }
        }

        let results = run.ledger.all_results()?;
        if let Err(e) = run.ledger.clear() {
            warn!("删除结果溢出日志失败: {}", e);
        }

        let stats = self.hasher.stats();
        debug!(
            "摘要统计: 计算 {} 次, 缓存命中 {} 次",
            stats.computed, stats.cache_hits
        );

        let summary = run.errors.complete();
        let operation = FileOperation {
            id,
            source_root: request.source_root,
            destination_roots: request.destination_roots,
            started_at,
            ended_at: Some(Utc::now()),
            policy: request.policy,
            labeling: request.labeling,
            results,
            cancelled,
            errors: summary,
            timing: run.timing.snapshot(),
        };

        let outcome = operation.errors.outcome();
        info!(
            "操作结束: {} 成功 {} 失败 {} ({:?})",
            id,
            operation.succeeded_count(),
            operation.failed_count(),
            outcome
        );
        if outcome == OperationOutcome::Failed && !cancelled {
            self.platform.present_alert(
                "复制校验未通过",
                &format!(
                    "{} 个文件失败，共 {} 个问题",
                    operation.failed_count(),
                    operation.errors.total
                ),
            );
        }

        Ok(operation)
    }

    /// 预检访问权限并枚举源文件（只枚举一次）
    async fn prepare(&self, request: &ExecuteRequest, run: &Run<'_>) -> CoreResult<Vec<PathBuf>> {
        if !self
            .fs
            .validate_access(&request.source_root, AccessMode::Read)
            .await
        {
            return Err(CoreError::FileAccessDenied {
                path: request.source_root.clone(),
            });
        }
        for destination in &request.destination_roots {
            if !self.fs.validate_access(destination, AccessMode::Write).await {
                return Err(CoreError::FileAccessDenied {
                    path: destination.clone(),
                });
            }
        }

        if run.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let files = self.fs.get_file_list(&request.source_root).await?;
        debug!("{} 列出 {} 个文件", self.fs.name(), files.len());
        if run.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        Ok(files)
    }

    /// 预检失败或台账写盘失败：整个操作终止
    fn abort(&self, run: &mut Run<'_>, e: CoreError) -> CoreError {
        error!("操作失败: {} - {}", run.id, e);
        if let Err(clear_err) = run.ledger.clear() {
            warn!("删除结果溢出日志失败: {}", clear_err);
        }
        let report = run
            .errors
            .report(&e, ErrorContext::default().with_stage(Stage::Preparing));
        self.platform.present_error(&report);
        if let Err(state_err) = self.state.fail() {
            warn!("更新失败状态失败: {}", state_err);
        }
        e
    }

    /// 文件边界检查点：检查取消，暂停时挂起直到恢复或取消
    async fn checkpoint(&self, run: &mut Run<'_>) -> CoreResult<()> {
        if run.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let mut rx = self.state.subscribe();
        if *rx.borrow_and_update() != OperationState::Paused {
            return Ok(());
        }

        info!("操作已暂停，等待恢复: {}", run.id);
        if let Err(e) = self.state.refresh_saved_progress() {
            warn!("更新暂停快照失败: {}", e);
        }
        run.timing.pause();
        let waited = loop {
            tokio::select! {
                _ = run.cancel.cancelled() => break Err(CoreError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        break Err(CoreError::Cancelled);
                    }
                    if *rx.borrow_and_update() != OperationState::Paused {
                        break Ok(());
                    }
                }
            }
        };
        run.timing.resume();
        if waited.is_ok() {
            info!("操作继续: {}", run.id);
        }
        waited
    }

    /// 处理一个 (文件, 目标) 组合；只有取消和台账错误会返回 Err
    async fn process_file(
        &self,
        run: &mut Run<'_>,
        source_root: &Path,
        destination_root: &Path,
        folder: &Path,
        relative: &Path,
    ) -> CoreResult<()> {
        let started = Instant::now();
        let name = normalize(relative);
        let source = source_root.join(relative);
        let destination = folder.join(relative);

        run.timing.enter_stage(Stage::Copying);
        run.emit(Stage::Copying, &name, Some(destination_root));

        let previous = self.previous_copy(run, &source, &destination, &name).await;
        let resumed = previous.is_some();
        let copied = match previous {
            Some(size) => Ok(size),
            None => self.copy(&run.cancel, &source, &destination).await,
        };
        let copied = match copied {
            Ok(size) => size,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!("复制失败: {} - {}", name, e);
                run.errors
                    .report(&e, ErrorContext::file(&source).with_stage(Stage::Copying));
                let result = self.failed_result(
                    run,
                    source_root,
                    destination_root,
                    folder,
                    relative,
                    &e,
                    started.elapsed().as_millis() as u64,
                );
                return self.finish_file(run, result, &name, destination_root, Stage::Copying);
            }
        };

        // 复制完成但尚未校验的临时结果，校验结束后替换
        let mut result = FileOperationResult {
            operation_id: run.id,
            relative_path: name.clone(),
            source_path: source.clone(),
            destination_root: destination_root.to_path_buf(),
            destination_path: destination.clone(),
            success: true,
            error: None,
            file_size: copied,
            verifications: Vec::new(),
            resumed,
            processing_ms: started.elapsed().as_millis() as u64,
            completed_at: Utc::now(),
        };
        run.ledger.add(ResultRow::from(&result))?;
        run.send_result(&result);

        run.timing.enter_stage(Stage::Verifying);
        run.emit(Stage::Verifying, &name, Some(destination_root));

        match self
            .verify(run.policy, &source, &destination, copied, resumed, &run.cancel)
            .await
        {
            Ok(checks) => {
                result.verifications = checks;
                let mismatch = result
                    .verification()
                    .filter(|v| !v.matches)
                    .map(|failed| (mismatch_error(&destination, failed), failed.method));
                if let Some((e, method)) = mismatch {
                    warn!("校验不一致: {} ({})", name, method);
                    run.errors
                        .report(&e, ErrorContext::file(&destination).with_stage(Stage::Verifying));
                    result.success = false;
                    result.error = Some(e.to_string());
                }
            }
            Err(e) if e.is_cancelled() => {
                result.success = false;
                result.error = Some(e.to_string());
                result.processing_ms = started.elapsed().as_millis() as u64;
                result.completed_at = Utc::now();
                self.supersede(run, &result)?;
                return Err(e);
            }
            Err(e) => {
                warn!("校验失败: {} - {}", name, e);
                run.errors
                    .report(&e, ErrorContext::file(&destination).with_stage(Stage::Verifying));
                result.success = false;
                result.error = Some(e.to_string());
            }
        }

        result.processing_ms = started.elapsed().as_millis() as u64;
        result.completed_at = Utc::now();
        self.supersede(run, &result)?;
        run.send_result(&result);

        run.processed += 1;
        run.timing.record_file(copied);
        self.record_progress(run);
        run.emit(Stage::Verifying, &name, Some(destination_root));
        Ok(())
    }

    /// 目标位置已有文件时：恢复运行中已完成且未变化的返回其大小，否则报告同名冲突并覆盖
    async fn previous_copy(
        &self,
        run: &Run<'_>,
        source: &Path,
        destination: &Path,
        name: &str,
    ) -> Option<u64> {
        let existing = match self.fs.get_file_metadata(destination).await {
            Ok(Some(existing)) => existing,
            Ok(None) => return None,
            Err(e) => {
                debug!("无法读取目标文件信息: {:?} - {}", destination, e);
                return None;
            }
        };

        if run.processed < run.resume_after {
            match self.fs.get_file_metadata(source).await {
                Ok(Some(current)) if current.same_content_stamp(&existing) => {
                    debug!("上次运行已完成，跳过复制: {}", name);
                    return Some(existing.size);
                }
                _ => debug!("目标文件与源文件不一致，重新复制: {}", name),
            }
        }

        let collision = CoreError::NameCollision {
            path: destination.to_path_buf(),
        };
        warn!("目标已存在同名文件，将被覆盖: {}", name);
        run.errors.report(
            &collision,
            ErrorContext::file(destination).with_stage(Stage::Copying),
        );
        None
    }

    async fn copy(
        &self,
        cancel: &CancellationToken,
        source: &Path,
        destination: &Path,
    ) -> CoreResult<u64> {
        let expected = self.fs.get_file_size(source).await?;
        let written = self.fs.copy_file(source, destination, cancel).await?;
        if written != expected {
            return Err(CoreError::integrity(
                destination,
                None,
                Some(expected.to_string()),
                Some(written.to_string()),
            ));
        }
        Ok(written)
    }

    /// 按策略校验，Thorough 在第一次不一致时停止。
    /// `reuse_destination` 为真时目标摘要也走缓存（上次运行已校验过且文件未变化）。
    async fn verify(
        &self,
        policy: VerificationPolicy,
        source: &Path,
        destination: &Path,
        size: u64,
        reuse_destination: bool,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<VerificationResult>> {
        let started = Instant::now();
        match policy {
            VerificationPolicy::SizeOnly => {
                let actual = self.fs.get_file_size(destination).await?;
                Ok(vec![VerificationResult {
                    method: VerificationMethod::Size,
                    source_digest: Some(size.to_string()),
                    destination_digest: Some(actual.to_string()),
                    matches: actual == size,
                    processing_ms: started.elapsed().as_millis() as u64,
                    file_size: size,
                }])
            }
            VerificationPolicy::Standard | VerificationPolicy::Thorough => {
                let algorithms = policy.algorithms(
                    self.config.standard_algorithm,
                    &self.config.thorough_algorithms,
                );
                let mut checks = Vec::with_capacity(algorithms.len());
                for algorithm in algorithms {
                    let started = Instant::now();
                    // 源文件摘要走缓存，多个目标只需计算一次；目标摘要总是重新计算
                    let (source_digest, destination_digest) = tokio::try_join!(
                        self.gate
                            .run(self.hasher.digest(source, algorithm, None, cancel)),
                        self.gate.run(async {
                            if reuse_destination {
                                self.hasher.digest(destination, algorithm, None, cancel).await
                            } else {
                                self.hasher
                                    .digest_fresh(destination, algorithm, None, cancel)
                                    .await
                            }
                        }),
                    )?;
                    let check = VerificationResult::from_digests(
                        algorithm,
                        source_digest,
                        destination_digest,
                        started.elapsed().as_millis() as u64,
                        size,
                    );
                    let matched = check.matches;
                    checks.push(check);
                    if !matched {
                        break;
                    }
                }
                Ok(checks)
            }
            VerificationPolicy::Paranoid => {
                let matches = self
                    .gate
                    .run(self.hasher.compare_bytes(source, destination, None, cancel))
                    .await?;
                Ok(vec![VerificationResult {
                    method: VerificationMethod::ByteComparison,
                    source_digest: None,
                    destination_digest: None,
                    matches,
                    processing_ms: started.elapsed().as_millis() as u64,
                    file_size: size,
                }])
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn failed_result(
        &self,
        run: &Run<'_>,
        source_root: &Path,
        destination_root: &Path,
        folder: &Path,
        relative: &Path,
        error: &CoreError,
        processing_ms: u64,
    ) -> FileOperationResult {
        FileOperationResult {
            operation_id: run.id,
            relative_path: normalize(relative),
            source_path: source_root.join(relative),
            destination_root: destination_root.to_path_buf(),
            destination_path: folder.join(relative),
            success: false,
            error: Some(error.to_string()),
            file_size: 0,
            verifications: Vec::new(),
            resumed: false,
            processing_ms,
            completed_at: Utc::now(),
        }
    }

    fn record(&self, run: &mut Run<'_>, result: FileOperationResult) -> CoreResult<()> {
        run.ledger.add(ResultRow::from(&result))?;
        run.send_result(&result);
        Ok(())
    }

    /// 用最终结果替换临时结果
    fn supersede(&self, run: &mut Run<'_>, result: &FileOperationResult) -> CoreResult<()> {
        let row = ResultRow::from(result);
        if !run.ledger.update_if_present(&row.key(), row.clone()) {
            run.ledger.add(row)?;
        }
        Ok(())
    }

    fn finish_file(
        &self,
        run: &mut Run<'_>,
        result: FileOperationResult,
        name: &str,
        destination_root: &Path,
        stage: Stage,
    ) -> CoreResult<()> {
        self.record(run, result)?;
        run.processed += 1;
        run.timing.record_file(0);
        self.record_progress(run);
        run.emit(stage, name, Some(destination_root));
        Ok(())
    }

    fn record_progress(&self, run: &Run<'_>) {
        self.state.record_progress(PauseProgress {
            fraction: run.fraction(),
            files_processed: run.processed,
            files_total: run.total,
        });
    }
}

fn normalize(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn mismatch_error(destination: &Path, check: &VerificationResult) -> CoreError {
    let algorithm = match check.method {
        VerificationMethod::Digest(algorithm) => Some(algorithm),
        _ => None,
    };
    CoreError::integrity(
        destination,
        algorithm,
        check.source_digest.clone(),
        check.destination_digest.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::ChecksumCache;
    use crate::core::reporting::ErrorCategory;
    use crate::platform::RecordingPlatform;
    use crate::storage::LocalFileSystem;
    use crate::storage::FileMetadata;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// 包装本地文件系统：可选延迟、篡改复制结果、枚举后删除文件，并统计复制次数
    struct TestFileSystem {
        inner: LocalFileSystem,
        delay: Duration,
        preflight_delay: Duration,
        corrupt: bool,
        vanish: Option<PathBuf>,
        copies: Arc<AtomicUsize>,
    }

    impl TestFileSystem {
        fn new() -> Self {
            Self {
                inner: LocalFileSystem::default(),
                delay: Duration::ZERO,
                preflight_delay: Duration::ZERO,
                corrupt: false,
                vanish: None,
                copies: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl FileSystemService for TestFileSystem {
        async fn get_file_list(&self, root: &Path) -> CoreResult<Vec<PathBuf>> {
            let files = self.inner.get_file_list(root).await?;
            if let Some(path) = &self.vanish {
                std::fs::remove_file(path).unwrap();
            }
            Ok(files)
        }

        async fn copy_file(
            &self,
            source: &Path,
            destination: &Path,
            cancel: &CancellationToken,
        ) -> CoreResult<u64> {
            self.copies.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let written = self.inner.copy_file(source, destination, cancel).await?;
            if self.corrupt {
                let mut data = std::fs::read(destination).unwrap();
                if let Some(first) = data.first_mut() {
                    *first ^= 0xff;
                }
                std::fs::write(destination, data).unwrap();
            }
            Ok(written)
        }

        async fn get_file_size(&self, path: &Path) -> CoreResult<u64> {
            self.inner.get_file_size(path).await
        }

        async fn get_file_metadata(&self, path: &Path) -> CoreResult<Option<FileMetadata>> {
            self.inner.get_file_metadata(path).await
        }

        async fn create_directory(&self, path: &Path) -> CoreResult<()> {
            self.inner.create_directory(path).await
        }

        async fn validate_access(&self, path: &Path, mode: AccessMode) -> bool {
            if !self.preflight_delay.is_zero() {
                tokio::time::sleep(self.preflight_delay).await;
            }
            self.inner.validate_access(path, mode).await
        }

        fn name(&self) -> &str {
            "test"
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        source: PathBuf,
        platform: Arc<RecordingPlatform>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let source = dir.path().join("CARD_01");
            std::fs::create_dir_all(&source).unwrap();
            Self {
                dir,
                source,
                platform: Arc::new(RecordingPlatform::default()),
            }
        }

        fn write(&self, name: &str, data: &[u8]) {
            let path = self.source.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }

        fn destination(&self, name: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::create_dir_all(&path).unwrap();
            path
        }

        fn engine(&self, fs: TestFileSystem) -> CopyVerifyEngine {
            let state =
                OperationStateService::open(self.dir.path().join("state/state.json")).unwrap();
            let cache = ChecksumCache::open(self.dir.path().join("state/checksums.json")).unwrap();
            CopyVerifyEngine::new(
                Arc::new(fs),
                FileHasher::default().with_cache(Arc::new(cache)),
                Arc::new(state),
                self.platform.clone(),
                EngineConfig {
                    ledger_dir: self.dir.path().join("ledger"),
                    ..Default::default()
                },
            )
        }
    }

    #[tokio::test]
    async fn test_standard_policy_two_files() {
        let fx = Fixture::new();
        fx.write("alpha.txt", b"alpha");
        fx.write("beta.txt", b"beta");
        let backup = fx.destination("BACKUP_A");
        let engine = fx.engine(TestFileSystem::new());

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let op = engine
            .execute(
                ExecuteRequest::new(&fx.source, vec![backup.clone()]),
                Some(progress_tx),
                None,
            )
            .await
            .unwrap();

        assert_eq!(op.results.len(), 2);
        assert!(op.results.iter().all(|r| r.success && r.matches == Some(true)));
        assert!(op
            .results
            .iter()
            .all(|r| r.verification_method == Some(VerificationMethod::Digest(DigestAlgorithm::Sha256))));
        assert_eq!(op.errors.outcome(), OperationOutcome::Passed);
        assert_eq!(std::fs::read(backup.join("CARD_01/alpha.txt")).unwrap(), b"alpha");

        let mut events = Vec::new();
        while let Ok(event) = progress_rx.try_recv() {
            events.push((event.stage, event.fraction));
        }
        assert_eq!(events.first(), Some(&(Stage::Preparing, 0.0)));
        assert_eq!(events.last(), Some(&(Stage::Completed, 1.0)));
        assert!(events.windows(2).all(|w| w[0].1 <= w[1].1), "{events:?}");
        assert_eq!(engine.state().current(), OperationState::Completed);
        assert!(!fx.dir.path().join("ledger").join(format!("{}.ndjson", op.id)).exists());
    }

    #[tokio::test]
    async fn test_paranoid_uses_byte_comparison() {
        let fx = Fixture::new();
        fx.write("alpha.txt", b"alpha");
        fx.write("beta.txt", b"beta");
        let backup = fx.destination("BACKUP_A");
        let engine = fx.engine(TestFileSystem::new());

        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let op = engine
            .execute(
                ExecuteRequest::new(&fx.source, vec![backup])
                    .with_policy(VerificationPolicy::Paranoid),
                None,
                Some(result_tx),
            )
            .await
            .unwrap();

        assert_eq!(op.results.len(), 2);
        for row in &op.results {
            assert_eq!(row.verification_method, Some(VerificationMethod::ByteComparison));
            assert_eq!(row.matches, Some(true));
        }

        let mut finals = Vec::new();
        while let Ok(result) = result_rx.try_recv() {
            if !result.verifications.is_empty() {
                finals.push(result);
            }
        }
        assert_eq!(finals.len(), 2);
        assert!(finals.iter().all(|r| r.is_verified()));
    }

    #[tokio::test]
    async fn test_every_destination_gets_every_file() {
        let fx = Fixture::new();
        fx.write("A001.MOV", b"clip one");
        fx.write("sub/A002.MOV", b"clip two");
        let first = fx.destination("BACKUP_A");
        let second = fx.destination("BACKUP_B");
        let engine = fx.engine(TestFileSystem::new());

        let labeling = LabelingSettings {
            prefix: Some("DAY1".to_string()),
            ..Default::default()
        };
        let op = engine
            .execute(
                ExecuteRequest::new(&fx.source, vec![first.clone(), second.clone()])
                    .with_policy(VerificationPolicy::Thorough)
                    .with_labeling(labeling),
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(op.results.len(), 4);
        assert_eq!(op.succeeded_count(), 4);
        for root in [&first, &second] {
            assert_eq!(std::fs::read(root.join("DAY1_CARD_01/sub/A002.MOV")).unwrap(), b"clip two");
        }
        // 第一个目标的结果在前
        assert_eq!(op.results[0].destination, first.to_string_lossy());
        assert_eq!(op.results[3].destination, second.to_string_lossy());
        assert_eq!(op.total_bytes(), 2 * (8 + 8));
    }

    #[tokio::test]
    async fn test_corrupted_copy_is_reported_per_file() {
        let fx = Fixture::new();
        fx.write("alpha.txt", b"alpha");
        fx.write("beta.txt", b"beta");
        let backup = fx.destination("BACKUP_A");
        let engine = fx.engine(TestFileSystem {
            corrupt: true,
            ..TestFileSystem::new()
        });

        let op = engine
            .execute(
                ExecuteRequest::new(&fx.source, vec![backup])
                    .with_policy(VerificationPolicy::Thorough),
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(op.results.len(), 2);
        assert_eq!(op.failed_count(), 2);
        // 第一个算法就不一致，不再计算第二个
        assert!(op
            .results
            .iter()
            .all(|r| r.verification_method == Some(VerificationMethod::Digest(DigestAlgorithm::Md5))));
        assert_eq!(op.errors.count(ErrorCategory::DataIntegrity), 2);
        assert!(op.errors.has_critical());
        assert_eq!(op.errors.outcome(), OperationOutcome::Failed);
        assert_eq!(engine.state().current(), OperationState::Completed);
        assert_eq!(fx.platform.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_source_progress_runs_zero_to_one() {
        let fx = Fixture::new();
        let backup = fx.destination("BACKUP_A");
        let engine = fx.engine(TestFileSystem::new());

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let op = engine
            .execute(ExecuteRequest::new(&fx.source, vec![backup]), Some(progress_tx), None)
            .await
            .unwrap();

        assert!(op.results.is_empty());
        let mut events = Vec::new();
        while let Ok(event) = progress_rx.try_recv() {
            events.push((event.stage, event.fraction));
        }
        assert_eq!(events, vec![(Stage::Preparing, 0.0), (Stage::Completed, 1.0)]);
    }

    #[tokio::test]
    async fn test_source_hashed_once_for_two_destinations() {
        let fx = Fixture::new();
        fx.write("A001.MOV", b"clip one");
        fx.write("A002.MOV", b"clip two");
        let first = fx.destination("BACKUP_A");
        let second = fx.destination("BACKUP_B");
        let engine = fx.engine(TestFileSystem::new());

        let op = engine
            .execute(ExecuteRequest::new(&fx.source, vec![first, second]), None, None)
            .await
            .unwrap();

        assert_eq!(op.succeeded_count(), 4);
        // 两个源文件各算一次，四个目标文件各算一次
        let stats = engine.hasher.stats();
        assert_eq!(stats.computed, 6);
        assert_eq!(stats.cache_hits, 2);
    }

    #[tokio::test]
    async fn test_existing_destination_file_is_a_warning() {
        let fx = Fixture::new();
        fx.write("alpha.txt", b"alpha");
        fx.write("beta.txt", b"beta");
        let backup = fx.destination("BACKUP_A");
        std::fs::create_dir_all(backup.join("CARD_01")).unwrap();
        std::fs::write(backup.join("CARD_01/alpha.txt"), b"stale").unwrap();
        let engine = fx.engine(TestFileSystem::new());

        let op = engine
            .execute(ExecuteRequest::new(&fx.source, vec![backup.clone()]), None, None)
            .await
            .unwrap();

        assert_eq!(op.succeeded_count(), 2);
        assert_eq!(op.errors.count(ErrorCategory::Warning), 1);
        assert_eq!(op.errors.total, 1);
        assert_eq!(op.errors.outcome(), OperationOutcome::PassedWithWarnings);
        assert_eq!(std::fs::read(backup.join("CARD_01/alpha.txt")).unwrap(), b"alpha");
        assert!(fx.platform.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_file_removed_after_enumeration_fails_alone() {
        let fx = Fixture::new();
        fx.write("alpha.txt", b"alpha");
        fx.write("beta.txt", b"beta");
        let backup = fx.destination("BACKUP_A");
        let engine = fx.engine(TestFileSystem {
            vanish: Some(fx.source.join("alpha.txt")),
            ..TestFileSystem::new()
        });

        let op = engine
            .execute(ExecuteRequest::new(&fx.source, vec![backup]), None, None)
            .await
            .unwrap();

        assert_eq!(op.results.len(), 2);
        let alpha = op.results.iter().find(|r| r.path == "alpha.txt").unwrap();
        let beta = op.results.iter().find(|r| r.path == "beta.txt").unwrap();
        assert!(!alpha.success);
        assert!(beta.success);
        assert_eq!(op.errors.count(ErrorCategory::FileSystem), 1);
        assert_eq!(op.errors.outcome(), OperationOutcome::Failed);
        assert_eq!(engine.state().current(), OperationState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_during_preflight_returns_empty_operation() {
        let fx = Fixture::new();
        fx.write("alpha.txt", b"alpha");
        let backup = fx.destination("BACKUP_A");
        let engine = Arc::new(fx.engine(TestFileSystem {
            preflight_delay: Duration::from_millis(100),
            ..TestFileSystem::new()
        }));

        let handle = {
            let engine = engine.clone();
            let request = ExecuteRequest::new(&fx.source, vec![backup.clone()]);
            tokio::spawn(async move { engine.execute(request, None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.cancel();

        let op = handle.await.unwrap().unwrap();
        assert!(op.cancelled);
        assert!(op.results.is_empty());
        assert_eq!(op.errors.count(ErrorCategory::Operation), 1);
        assert_eq!(engine.state().current(), OperationState::Cancelled);
        assert!(fx.platform.errors().is_empty());
        assert!(!backup.join("CARD_01").exists());
    }

    #[tokio::test]
    async fn test_inaccessible_destination_fails_fast() {
        let fx = Fixture::new();
        fx.write("alpha.txt", b"alpha");
        let missing = fx.dir.path().join("NOT_MOUNTED");
        let engine = fx.engine(TestFileSystem::new());

        let err = engine
            .execute(ExecuteRequest::new(&fx.source, vec![missing.clone()]), None, None)
            .await
            .unwrap_err();

        match err {
            CoreError::FileAccessDenied { path } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.state().current(), OperationState::Failed);
        assert_eq!(fx.platform.errors().len(), 1);
    }

    fn slow_fixture(count: usize) -> (Fixture, PathBuf) {
        let fx = Fixture::new();
        for i in 0..count {
            fx.write(&format!("clip_{:02}.mov", i), format!("frame {}", i).as_bytes());
        }
        let backup = fx.destination("BACKUP_A");
        (fx, backup)
    }

    fn slow_fs() -> TestFileSystem {
        TestFileSystem {
            delay: Duration::from_millis(20),
            ..TestFileSystem::new()
        }
    }

    #[tokio::test]
    async fn test_cancel_returns_partial_results() {
        let (fx, backup) = slow_fixture(20);
        let engine = Arc::new(fx.engine(slow_fs()));

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let handle = {
            let engine = engine.clone();
            let request = ExecuteRequest::new(&fx.source, vec![backup]);
            tokio::spawn(async move { engine.execute(request, Some(progress_tx), None).await })
        };

        while let Some(event) = progress_rx.recv().await {
            if event.files_processed >= 3 {
                break;
            }
        }
        engine.cancel();

        let op = handle.await.unwrap().unwrap();
        assert!(op.cancelled);
        assert!(op.results.len() >= 3 && op.results.len() < 20);
        assert_eq!(op.errors.count(ErrorCategory::Operation), 1);
        assert_eq!(engine.state().current(), OperationState::Cancelled);
        assert!(engine.state().saved_states().is_empty());
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let (fx, backup) = slow_fixture(20);
        let engine = Arc::new(fx.engine(slow_fs()));

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let handle = {
            let engine = engine.clone();
            let request = ExecuteRequest::new(&fx.source, vec![backup]);
            tokio::spawn(async move { engine.execute(request, Some(progress_tx), None).await })
        };

        while let Some(event) = progress_rx.recv().await {
            if event.files_processed >= 2 {
                break;
            }
        }
        engine.pause().unwrap();
        let id = engine.state().operation_id().unwrap();
        let saved = engine.state().saved_state(id).unwrap();
        assert_eq!(saved.reason, PauseReason::UserRequested);
        assert!(!engine.state().can_auto_resume(Some(1.0)));

        // 正在处理的文件完成后停在检查点
        tokio::time::sleep(Duration::from_millis(80)).await;
        while progress_rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(progress_rx.try_recv().is_err());
        assert!(!handle.is_finished());

        engine.resume().unwrap();
        let op = handle.await.unwrap().unwrap();
        assert!(!op.cancelled);
        assert_eq!(op.succeeded_count(), 20);
        assert!(op.timing.paused_ms >= 100);
        assert!(engine.state().saved_state(id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_while_paused() {
        let (fx, backup) = slow_fixture(10);
        let engine = Arc::new(fx.engine(slow_fs()));

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let handle = {
            let engine = engine.clone();
            let request = ExecuteRequest::new(&fx.source, vec![backup]);
            tokio::spawn(async move { engine.execute(request, Some(progress_tx), None).await })
        };

        while let Some(event) = progress_rx.recv().await {
            if event.files_processed >= 1 {
                break;
            }
        }
        engine.pause().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.cancel();

        let op = handle.await.unwrap().unwrap();
        assert!(op.cancelled);
        assert_eq!(engine.state().current(), OperationState::Cancelled);
        assert!(engine.state().saved_states().is_empty());
    }

    #[tokio::test]
    async fn test_restart_resume_skips_finished_pairs() {
        let (fx, backup) = slow_fixture(20);

        let id = {
            let engine = Arc::new(fx.engine(slow_fs()));
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let handle = {
                let engine = engine.clone();
                let request = ExecuteRequest::new(&fx.source, vec![backup.clone()]);
                tokio::spawn(async move { engine.execute(request, Some(progress_tx), None).await })
            };

            while let Some(event) = progress_rx.recv().await {
                if event.files_processed >= 10 {
                    break;
                }
            }
            engine.pause().unwrap();
            // 正在处理的文件完成后停在检查点，然后进程退出
            tokio::time::sleep(Duration::from_millis(150)).await;
            handle.abort();
            let _ = handle.await;
            engine.state().operation_id().unwrap()
        };

        let fs = slow_fs();
        let copies = fs.copies.clone();
        let engine = fx.engine(fs);
        let saved = engine.state().saved_state(id).unwrap();
        let done = saved.progress.files_processed;
        assert!((10..20).contains(&done));

        let op = engine
            .execute(ExecuteRequest::from_saved(&saved), None, None)
            .await
            .unwrap();

        assert_eq!(op.id, id);
        assert_eq!(op.results.len(), 20);
        assert_eq!(op.succeeded_count(), 20);
        assert_eq!(op.results.iter().filter(|r| r.resumed).count(), done as usize);
        assert_eq!(copies.load(Ordering::SeqCst), 20 - done as usize);
        // 已完成的组合两端摘要都来自缓存
        assert_eq!(engine.hasher.stats().computed, 2 * (20 - done));
        assert_eq!(op.errors.outcome(), OperationOutcome::Passed);
        assert!(engine.state().saved_states().is_empty());
    }

    #[tokio::test]
    async fn test_resume_recopies_changed_destination() {
        let fx = Fixture::new();
        fx.write("alpha.txt", b"alpha");
        fx.write("beta.txt", b"beta");
        let backup = fx.destination("BACKUP_A");
        let engine = fx.engine(TestFileSystem::new());
        let op = engine
            .execute(ExecuteRequest::new(&fx.source, vec![backup.clone()]), None, None)
            .await
            .unwrap();

        // 上次运行后目标文件被改动
        std::fs::write(backup.join("CARD_01/alpha.txt"), b"ALPHA!").unwrap();

        let fs = TestFileSystem::new();
        let copies = fs.copies.clone();
        let engine = fx.engine(fs);
        let mut request = ExecuteRequest::new(&fx.source, vec![backup.clone()]);
        request.operation_id = Some(op.id);
        request.resume_after = 2;
        let op = engine.execute(request, None, None).await.unwrap();

        assert_eq!(copies.load(Ordering::SeqCst), 1);
        assert_eq!(op.succeeded_count(), 2);
        assert_eq!(op.results.iter().filter(|r| r.resumed).count(), 1);
        assert_eq!(op.errors.outcome(), OperationOutcome::PassedWithWarnings);
        assert_eq!(std::fs::read(backup.join("CARD_01/alpha.txt")).unwrap(), b"alpha");
    }
}
