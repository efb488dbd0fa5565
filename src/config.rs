//! 应用配置模块
//!
//! 所有配置保存在 `<config_dir>/config.json` 中，每个模块占用一个顶层键。
//! 缺失或无法解析的部分使用默认值。

use crate::core::state::ResumePolicy;
use crate::logging::LogConfig;
use crate::models::DigestAlgorithm;
use crate::storage::local::default_exclude_patterns;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

/// config.json 中的一个顶层配置段
pub trait ConfigSection: Serialize + DeserializeOwned + Default {
    const KEY: &'static str;

    /// 从配置文件加载
    fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join("config.json");
        fs::read_to_string(&config_file)
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get(Self::KEY).cloned())
            .and_then(|section| serde_json::from_value::<Self>(section).ok())
            .unwrap_or_default()
    }

    /// 保存，不影响其他配置段
    fn save(&self, config_dir: &Path) -> io::Result<()> {
        fs::create_dir_all(config_dir)?;
        let config_file = config_dir.join("config.json");

        // 读取现有配置
        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };
        if !config.is_object() {
            config = serde_json::json!({});
        }

        config[Self::KEY] = serde_json::to_value(self).map_err(io::Error::other)?;

        let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
        fs::write(&config_file, content)
    }
}

/// 摘要缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 缓存条目有效期（秒）
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    3600 // 默认 1 小时
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: default_cache_ttl(),
        }
    }
}

impl ConfigSection for CacheConfig {
    const KEY: &'static str = "cache";
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// 结果台账配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerConfig {
    /// 内存中最多保留的结果行数
    #[serde(default = "default_memory_cap")]
    pub memory_cap: usize,
}

fn default_memory_cap() -> usize {
    crate::core::ledger::DEFAULT_MEMORY_CAP
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            memory_cap: default_memory_cap(),
        }
    }
}

impl ConfigSection for LedgerConfig {
    const KEY: &'static str = "ledger";
}

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    #[serde(default = "default_max_concurrent_hashes")]
    pub max_concurrent_hashes: usize,
    /// 读取分块大小（KB）
    #[serde(default = "default_chunk_size_kb")]
    pub chunk_size_kb: usize,
    #[serde(default = "default_standard_algorithm")]
    pub standard_algorithm: DigestAlgorithm,
    #[serde(default = "default_thorough_algorithms")]
    pub thorough_algorithms: Vec<DigestAlgorithm>,
    /// 枚举源文件时跳过的文件
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

fn default_max_concurrent_hashes() -> usize {
    2
}

fn default_chunk_size_kb() -> usize {
    64
}

fn default_standard_algorithm() -> DigestAlgorithm {
    DigestAlgorithm::Sha256
}

fn default_thorough_algorithms() -> Vec<DigestAlgorithm> {
    vec![DigestAlgorithm::Md5, DigestAlgorithm::Sha256]
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_hashes: default_max_concurrent_hashes(),
            chunk_size_kb: default_chunk_size_kb(),
            standard_algorithm: default_standard_algorithm(),
            thorough_algorithms: default_thorough_algorithms(),
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

impl ConfigSection for EngineSettings {
    const KEY: &'static str = "engine";
}

impl EngineSettings {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size_kb.max(1) * 1024
    }
}

/// 自动恢复配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConfig {
    #[serde(default = "default_auto_resume_window")]
    pub auto_resume_window_secs: u64,
    /// 电量恢复到该比例以上才自动恢复
    #[serde(default = "default_low_battery_threshold")]
    pub low_battery_resume_threshold: f32,
}

fn default_auto_resume_window() -> u64 {
    3600
}

fn default_low_battery_threshold() -> f32 {
    0.2
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            auto_resume_window_secs: default_auto_resume_window(),
            low_battery_resume_threshold: default_low_battery_threshold(),
        }
    }
}

impl ConfigSection for ResumeConfig {
    const KEY: &'static str = "resume";
}

impl ResumeConfig {
    pub fn policy(&self) -> ResumePolicy {
        ResumePolicy {
            auto_resume_window: Duration::from_secs(self.auto_resume_window_secs),
            low_battery_threshold: self.low_battery_resume_threshold,
        }
    }
}

/// 全部配置
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub cache: CacheConfig,
    pub ledger: LedgerConfig,
    pub engine: EngineSettings,
    pub resume: ResumeConfig,
    pub log: LogConfig,
}

impl AppConfig {
    pub fn load(config_dir: &Path) -> Self {
        Self {
            cache: CacheConfig::load(config_dir),
            ledger: LedgerConfig::load(config_dir),
            engine: EngineSettings::load(config_dir),
            resume: ResumeConfig::load(config_dir),
            log: LogConfig::load(config_dir),
        }
    }
}
