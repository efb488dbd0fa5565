//! 校验和缓存
//!
//! 以 (路径, 算法, 大小, 修改时间) 为键保存摘要，避免重复计算未变化的文件。
//! 条目超过 TTL 后视为不存在。每次写入都同步落盘（整份 JSON 原子替换）。

use crate::core::persist::{read_json, write_json_atomic};
use crate::error::{CoreError, CoreResult};
use crate::models::DigestAlgorithm;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 默认有效期 1 小时
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// 缓存键
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKey {
    pub path: String,
    pub algorithm: DigestAlgorithm,
    pub size: u64,
    /// 修改时间（Unix 纳秒）
    pub modified: i64,
}

/// 缓存条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: CacheKey,
    pub digest: String,
    pub cached_at: DateTime<Utc>,
}

/// 落盘格式
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    entries: Vec<CacheEntry>,
}

/// 文件当前的大小和修改时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    size: u64,
    modified: i64,
}

async fn stamp(path: &Path) -> CoreResult<FileStamp> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| CoreError::from_io(path, e))?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    Ok(FileStamp {
        size: meta.len(),
        modified,
    })
}

fn slot(path: &str, algorithm: DigestAlgorithm) -> String {
    format!("{}\u{0}{}", algorithm, path)
}

fn path_string(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

/// 校验和缓存
pub struct ChecksumCache {
    file_path: PathBuf,
    ttl: Duration,
    /// (算法, 路径) -> 条目
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ChecksumCache {
    /// 从磁盘加载缓存，丢弃已过期的条目
    pub fn open(file_path: PathBuf) -> CoreResult<Self> {
        Self::open_with_ttl(file_path, DEFAULT_TTL)
    }

    pub fn open_with_ttl(file_path: PathBuf, ttl: Duration) -> CoreResult<Self> {
        let stored: CacheFile = read_json(&file_path)?.unwrap_or_default();
        let now = Utc::now();
        let total = stored.entries.len();

        let entries: HashMap<String, CacheEntry> = stored
            .entries
            .into_iter()
            .filter(|e| !Self::is_expired_at(ttl, e, now))
            .map(|e| (slot(&e.key.path, e.key.algorithm), e))
            .collect();

        if total > 0 {
            info!(
                "加载校验和缓存 {} 条 (过期丢弃 {} 条): {:?}",
                entries.len(),
                total - entries.len(),
                file_path
            );
        }

        Ok(Self {
            file_path,
            ttl,
            entries: Mutex::new(entries),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_expired_at(ttl: Duration, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let age = now
            .signed_duration_since(entry.cached_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        age >= ttl
    }

    /// 查询缓存；文件大小或修改时间变化、条目过期都视为未命中
    pub async fn get(&self, path: &Path, algorithm: DigestAlgorithm) -> Option<String> {
        let current = stamp(path).await.ok()?;
        let key = slot(&path_string(path), algorithm);

        let entries = self.entries.lock().await;
        let entry = entries.get(&key)?;

        if entry.key.size != current.size || entry.key.modified != current.modified {
            debug!("文件已变化，缓存失效: {:?}", path);
            return None;
        }
        if Self::is_expired_at(self.ttl, entry, Utc::now()) {
            debug!("缓存条目已过期: {:?}", path);
            return None;
        }

        Some(entry.digest.clone())
    }

    /// 写入摘要并立即落盘
    pub async fn set(&self, digest: &str, path: &Path, algorithm: DigestAlgorithm) -> CoreResult<()> {
        let current = stamp(path).await?;
        let path_str = path_string(path);

        let mut entries = self.entries.lock().await;
        entries.insert(
            slot(&path_str, algorithm),
            CacheEntry {
                key: CacheKey {
                    path: path_str,
                    algorithm,
                    size: current.size,
                    modified: current.modified,
                },
                digest: digest.to_lowercase(),
                cached_at: Utc::now(),
            },
        );

        self.persist(&entries)
    }

    /// 清理过期条目，返回清理数量
    pub async fn purge_expired(&self) -> CoreResult<usize> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let now = Utc::now();
        let ttl = self.ttl;
        entries.retain(|_, e| !Self::is_expired_at(ttl, e, now));
        let removed = before - entries.len();

        if removed > 0 {
            self.persist(&entries)?;
            info!("清理过期缓存 {} 条", removed);
        }
        Ok(removed)
    }

    /// 清空缓存并删除缓存文件
    pub async fn clear(&self) -> CoreResult<()> {
        let mut entries = self.entries.lock().await;
        entries.clear();
        match std::fs::remove_file(&self.file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::from_io(&self.file_path, e)),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    fn persist(&self, entries: &HashMap<String, CacheEntry>) -> CoreResult<()> {
        let file = CacheFile {
            entries: entries.values().cloned().collect(),
        };
        write_json_atomic(&self.file_path, &file)
    }
}
