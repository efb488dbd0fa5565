use super::{AccessMode, FileMetadata, FileSystemService};
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use filetime::FileTime;
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// 默认排除的系统垃圾文件
pub fn default_exclude_patterns() -> Vec<String> {
    vec![
        ".DS_Store".to_string(),
        "Thumbs.db".to_string(),
        "._*".to_string(),
    ]
}

/// 排除规则（glob 风格，编译成正则）
///
/// 不含 `/` 的规则匹配文件名，含 `/` 的规则匹配整个相对路径。大小写不敏感。
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    name_rules: Vec<Regex>,
    path_rules: Vec<Regex>,
}

impl ExcludeFilter {
    pub fn new(patterns: &[String]) -> Self {
        let mut filter = Self::default();
        for pattern in patterns {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }
            match Self::compile(pattern) {
                Ok(re) if pattern.contains('/') => filter.path_rules.push(re),
                Ok(re) => filter.name_rules.push(re),
                Err(e) => warn!("忽略无效的排除规则 {}: {}", pattern, e),
            }
        }
        filter
    }

    fn compile(pattern: &str) -> Result<Regex, regex::Error> {
        let mut re = String::from("(?i)^");
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    re.push_str(".*");
                }
                '*' => re.push_str("[^/]*"),
                '?' => re.push_str("[^/]"),
                c => re.push_str(&regex::escape(&c.to_string())),
            }
        }
        re.push('$');
        Regex::new(&re)
    }

    pub fn is_empty(&self) -> bool {
        self.name_rules.is_empty() && self.path_rules.is_empty()
    }

    /// relative 使用 `/` 作为分隔符
    pub fn is_excluded(&self, relative: &str) -> bool {
        let name = relative.rsplit('/').next().unwrap_or(relative);
        self.name_rules.iter().any(|re| re.is_match(name))
            || self.path_rules.iter().any(|re| re.is_match(relative))
    }
}

pub struct LocalFileSystem {
    filter: ExcludeFilter,
    name: String,
}

impl Default for LocalFileSystem {
    fn default() -> Self {
        Self::new(&default_exclude_patterns())
    }
}

impl LocalFileSystem {
    pub fn new(exclude_patterns: &[String]) -> Self {
        Self {
            filter: ExcludeFilter::new(exclude_patterns),
            name: "local".to_string(),
        }
    }

    pub fn filter(&self) -> &ExcludeFilter {
        &self.filter
    }

    /// 规范化路径分隔符（统一使用 /）
    fn normalize_path(path: &Path) -> String {
        path.to_string_lossy().replace('\\', "/")
    }

    /// 与目标文件同目录的临时文件
    fn temp_path(destination: &Path) -> PathBuf {
        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        destination.with_file_name(format!(".{}.verifycopy.tmp", name))
    }

    async fn copy_to_temp(
        &self,
        source: &Path,
        temp: &Path,
        cancel: &CancellationToken,
    ) -> CoreResult<u64> {
        let mut reader = fs::File::open(source)
            .await
            .map_err(|e| CoreError::from_io(source, e))?;
        let mut writer = fs::File::create(temp)
            .await
            .map_err(|e| CoreError::from_io(temp, e))?;

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let n = reader
                .read(&mut buffer)
                .await
                .map_err(|e| CoreError::from_io(source, e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buffer[..n])
                .await
                .map_err(|e| CoreError::from_io(temp, e))?;
            written += n as u64;
            tokio::task::yield_now().await;
        }

        writer.flush().await.map_err(|e| CoreError::from_io(temp, e))?;
        writer
            .sync_all()
            .await
            .map_err(|e| CoreError::from_io(temp, e))?;
        Ok(written)
    }
}

#[async_trait]
impl FileSystemService for LocalFileSystem {
    async fn get_file_list(&self, root: &Path) -> CoreResult<Vec<PathBuf>> {
        let meta = fs::metadata(root)
            .await
            .map_err(|e| CoreError::from_io(root, e))?;
        if !meta.is_dir() {
            return Err(CoreError::FileNotFound {
                path: root.to_path_buf(),
            });
        }

        let base = root.to_path_buf();
        let filter = self.filter.clone();

        // 使用 spawn_blocking 避免阻塞 async runtime
        let (files, excluded) = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            let mut excluded = 0usize;
            for entry in WalkDir::new(&base)
                .follow_links(false)
                .sort_by_file_name()
            {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("跳过无法读取的条目: {}", e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&base) else {
                    continue;
                };
                if filter.is_excluded(&Self::normalize_path(relative)) {
                    debug!("排除文件: {:?}", relative);
                    excluded += 1;
                    continue;
                }
                files.push(relative.to_path_buf());
            }
            (files, excluded)
        })
        .await
        .map_err(|e| CoreError::from_io(root, io::Error::other(e)))?;

        info!(
            "扫描完成: {:?}, {} 个文件, 排除 {} 个",
            root,
            files.len(),
            excluded
        );
        Ok(files)
    }

    async fn copy_file(
        &self,
        source: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> CoreResult<u64> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::from_io(parent, e))?;
        }

        // 使用临时文件写入，然后原子重命名；出错、取消或 future 被丢弃时删除临时文件
        let temp = Self::temp_path(destination);
        let cleanup = scopeguard::guard(temp.clone(), |temp| {
            let _ = std::fs::remove_file(&temp);
        });

        let written = self.copy_to_temp(source, &temp, cancel).await?;
        fs::rename(&temp, destination)
            .await
            .map_err(|e| CoreError::from_io(destination, e))?;
        scopeguard::ScopeGuard::into_inner(cleanup);

        // 保留源文件的修改时间
        match fs::metadata(source).await {
            Ok(meta) => {
                let mtime = FileTime::from_last_modification_time(&meta);
                if let Err(e) = filetime::set_file_mtime(destination, mtime) {
                    warn!("无法设置修改时间: {:?} - {}", destination, e);
                }
            }
            Err(e) => warn!("无法读取源文件时间: {:?} - {}", source, e),
        }

        debug!("复制完成: {:?} -> {:?} ({} 字节)", source, destination, written);
        Ok(written)
    }

    async fn get_file_size(&self, path: &Path) -> CoreResult<u64> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| CoreError::from_io(path, e))?;
        Ok(meta.len())
    }

    async fn get_file_metadata(&self, path: &Path) -> CoreResult<Option<FileMetadata>> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(FileMetadata {
                size: meta.len(),
                modified: meta.modified().ok(),
            })),
            // 同名目录等非普通文件不算已有文件，后续复制会报错
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::from_io(path, e)),
        }
    }

    async fn create_directory(&self, path: &Path) -> CoreResult<()> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| CoreError::from_io(path, e))
    }

    async fn validate_access(&self, path: &Path, mode: AccessMode) -> bool {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return false,
            Err(e) => {
                debug!("访问检查失败: {:?} - {}", path, e);
                return false;
            }
        }

        match mode {
            AccessMode::Read => fs::read_dir(path).await.is_ok(),
            AccessMode::Write => {
                let marker = path.join(format!(".verifycopy-access-{}", uuid::Uuid::new_v4()));
                match fs::write(&marker, b"").await {
                    Ok(()) => {
                        let _ = fs::remove_file(&marker).await;
                        true
                    }
                    Err(e) => {
                        debug!("目录不可写: {:?} - {}", path, e);
                        false
                    }
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
