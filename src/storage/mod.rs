pub mod local;

use crate::error::CoreResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

pub use local::{ExcludeFilter, LocalFileSystem};

/// 访问检查的方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// 文件的大小与修改时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl FileMetadata {
    /// 大小和修改时间都一致（复制时保留了源文件的修改时间）
    pub fn same_content_stamp(&self, other: &FileMetadata) -> bool {
        self.size == other.size && self.modified.is_some() && self.modified == other.modified
    }
}

/// 引擎依赖的文件系统接口
#[async_trait]
pub trait FileSystemService: Send + Sync {
    /// 递归列出 root 下的所有文件，返回相对路径，顺序在同一次运行内稳定
    async fn get_file_list(&self, root: &Path) -> CoreResult<Vec<PathBuf>>;

    /// 复制单个文件，返回写入的字节数
    async fn copy_file(
        &self,
        source: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> CoreResult<u64>;

    async fn get_file_size(&self, path: &Path) -> CoreResult<u64>;

    /// 文件不存在时返回 None
    async fn get_file_metadata(&self, path: &Path) -> CoreResult<Option<FileMetadata>>;

    async fn create_directory(&self, path: &Path) -> CoreResult<()>;

    /// 检查目录是否可读 / 可写
    async fn validate_access(&self, path: &Path, mode: AccessMode) -> bool;

    /// 获取名称（用于日志）
    fn name(&self) -> &str;
}
