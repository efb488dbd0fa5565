use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod models;
pub mod platform;
pub mod storage;

pub use crate::core::{CopyVerifyEngine, EngineConfig, ExecuteRequest};
pub use error::{CoreError, CoreResult};
pub use models::{
    DigestAlgorithm, FileOperation, FileOperationResult, LabelingSettings, ProgressEvent,
    VerificationPolicy,
};

use crate::config::AppConfig;
use crate::core::{
    ChannelLifecycleSignal, ChecksumCache, FileHasher, OperationStateService, SavedOperationState,
};
use crate::platform::{LogPlatform, PlatformManager};
use crate::storage::{FileSystemService, LocalFileSystem};

/// 数据目录：默认配置目录，或 config.json 中 data_path 指定的已存在目录
pub fn data_dir(default_config_dir: &Path) -> PathBuf {
    let config_file = default_config_dir.join("config.json");
    std::fs::read_to_string(&config_file)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|config| config.get("data_path")?.as_str().map(PathBuf::from))
        .filter(|p| p.is_dir())
        .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
        .unwrap_or_else(|| default_config_dir.to_path_buf())
}

/// 应用服务，全部显式构造并注入
pub struct AppServices {
    pub config_dir: PathBuf,
    pub config: AppConfig,
    pub cache: Option<Arc<ChecksumCache>>,
    pub state: Arc<OperationStateService>,
    pub lifecycle: Arc<ChannelLifecycleSignal>,
    pub engine: Arc<CopyVerifyEngine>,
    lifecycle_task: tokio::task::JoinHandle<()>,
}

impl AppServices {
    pub async fn new(config_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(config_dir)?;
        let config = AppConfig::load(config_dir);

        let cache = if config.cache.enabled {
            let cache =
                ChecksumCache::open_with_ttl(config_dir.join("checksums.json"), config.cache.ttl())?;
            let purged = cache.purge_expired().await?;
            if purged > 0 {
                tracing::debug!("清理过期摘要缓存 {} 条", purged);
            }
            Some(Arc::new(cache))
        } else {
            None
        };

        let mut hasher = FileHasher::new(config.engine.chunk_size());
        if let Some(cache) = &cache {
            hasher = hasher.with_cache(cache.clone());
        }

        let state = Arc::new(OperationStateService::open_with_policy(
            config_dir.join("operation_state.json"),
            config.resume.policy(),
        )?);

        let lifecycle = Arc::new(ChannelLifecycleSignal::default());
        let lifecycle_task = state.spawn_lifecycle_listener(lifecycle.as_ref());

        let fs: Arc<dyn FileSystemService> =
            Arc::new(LocalFileSystem::new(&config.engine.exclude_patterns));
        let platform: Arc<dyn PlatformManager> = Arc::new(LogPlatform);

        let engine = Arc::new(CopyVerifyEngine::new(
            fs,
            hasher,
            state.clone(),
            platform,
            EngineConfig {
                max_concurrent_hashes: config.engine.max_concurrent_hashes,
                standard_algorithm: config.engine.standard_algorithm,
                thorough_algorithms: config.engine.thorough_algorithms.clone(),
                ledger_dir: config_dir.join("ledger"),
                ledger_capacity: config.ledger.memory_cap,
            },
        ));

        tracing::info!("服务初始化完成: {:?}", config_dir);
        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            config,
            cache,
            state,
            lifecycle,
            engine,
            lifecycle_task,
        })
    }

    /// 上次进程留下的暂停操作
    pub fn pending_operations(&self) -> Vec<SavedOperationState> {
        self.state.saved_states()
    }

    /// 用暂停快照重建请求，已完成的部分不再复制和重新计算摘要
    pub fn resume_request(&self, operation_id: uuid::Uuid) -> Option<ExecuteRequest> {
        self.state
            .saved_state(operation_id)
            .map(|saved| ExecuteRequest::from_saved(&saved))
    }

    /// 放弃一个暂停的操作
    pub fn discard_operation(&self, operation_id: uuid::Uuid) -> CoreResult<()> {
        self.state.discard_saved(operation_id)
    }

    /// 清理资源（退出时调用）
    pub fn cleanup(&self) {
        tracing::info!("正在清理应用资源...");
        self.engine.cancel();
        self.lifecycle_task.abort();
    }
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{LifecycleEvent, OperationState, PauseReason};

    #[tokio::test]
    async fn test_services_run_operation_and_cache_digests() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("CARD");
        let backup = dir.path().join("BACKUP");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&backup).unwrap();
        std::fs::write(source.join("A001.MOV"), b"footage").unwrap();

        let services = AppServices::new(&dir.path().join("config")).await.unwrap();
        let op = services
            .engine
            .execute(ExecuteRequest::new(&source, vec![backup]), None, None)
            .await
            .unwrap();

        assert_eq!(op.succeeded_count(), 1);
        let cache = services.cache.as_ref().unwrap();
        // 源文件和目标文件的摘要都已缓存
        assert_eq!(cache.len().await, 2);
        assert!(services.pending_operations().is_empty());
        services.cleanup();
    }

    #[tokio::test]
    async fn test_lifecycle_signal_reaches_state_service() {
        let dir = tempfile::tempdir().unwrap();
        let services = AppServices::new(dir.path()).await.unwrap();
        let context = crate::core::state::OperationContext {
            source_root: dir.path().join("CARD"),
            destination_roots: vec![dir.path().join("BACKUP")],
            policy: VerificationPolicy::Standard,
            labeling: LabelingSettings::default(),
        };
        services.state.start(uuid::Uuid::new_v4(), context).unwrap();

        let mut rx = services.state.subscribe();
        services.lifecycle.emit(LifecycleEvent::EnteredBackground);
        rx.wait_for(|s| *s == OperationState::Paused).await.unwrap();
        assert_eq!(services.state.pause_reason(), Some(PauseReason::Backgrounded));
        assert_eq!(services.pending_operations().len(), 1);
        services.cleanup();
    }

    #[tokio::test]
    async fn test_resume_pending_operation_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        let source = dir.path().join("CARD");
        let backup = dir.path().join("BACKUP");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&backup).unwrap();
        std::fs::write(source.join("A001.MOV"), b"footage").unwrap();

        let id = uuid::Uuid::new_v4();
        {
            let services = AppServices::new(&config_dir).await.unwrap();
            let context = crate::core::state::OperationContext {
                source_root: source.clone(),
                destination_roots: vec![backup.clone()],
                policy: VerificationPolicy::Standard,
                labeling: LabelingSettings::default(),
            };
            services.state.start(id, context).unwrap();
            services.state.pause(PauseReason::SystemSleep).unwrap();
            services.cleanup();
        }

        let services = AppServices::new(&config_dir).await.unwrap();
        assert!(services.resume_request(uuid::Uuid::new_v4()).is_none());
        let request = services.resume_request(id).unwrap();
        assert_eq!(request.destination_roots, vec![backup.clone()]);

        let op = services.engine.execute(request, None, None).await.unwrap();
        assert_eq!(op.id, id);
        assert_eq!(op.succeeded_count(), 1);
        assert_eq!(std::fs::read(backup.join("CARD/A001.MOV")).unwrap(), b"footage");
        assert!(services.pending_operations().is_empty());
        services.cleanup();
    }

    #[tokio::test]
    async fn test_discard_pending_operation() {
        let dir = tempfile::tempdir().unwrap();
        let id = uuid::Uuid::new_v4();
        {
            let services = AppServices::new(dir.path()).await.unwrap();
            let context = crate::core::state::OperationContext {
                source_root: dir.path().join("CARD"),
                destination_roots: vec![dir.path().join("BACKUP")],
                policy: VerificationPolicy::Standard,
                labeling: LabelingSettings::default(),
            };
            services.state.start(id, context).unwrap();
            services.state.pause(PauseReason::UserRequested).unwrap();
            services.cleanup();
        }

        let services = AppServices::new(dir.path()).await.unwrap();
        assert_eq!(services.pending_operations().len(), 1);
        services.discard_operation(id).unwrap();
        assert!(services.pending_operations().is_empty());
        services.cleanup();

        let reopened = AppServices::new(dir.path()).await.unwrap();
        assert!(reopened.pending_operations().is_empty());
        reopened.cleanup();
    }

    #[test]
    fn test_data_dir_override() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(data_dir(dir.path()), dir.path());

        let custom = dir.path().join("custom");
        std::fs::create_dir_all(&custom).unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            serde_json::json!({ "data_path": custom }).to_string(),
        )
        .unwrap();
        assert_eq!(data_dir(dir.path()), custom);
    }
}
