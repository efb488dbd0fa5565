//! 核心错误类型
//!
//! 引擎内部所有可失败操作统一返回 `CoreResult<T>`。原始 `io::Error`
//! 通过 `CoreError::from_io` 归类，之后再交给 `core::reporting` 转成
//! 面向用户的错误报告。

use crate::models::DigestAlgorithm;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("文件不存在: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("无权访问: {}", path.display())]
    FileAccessDenied { path: PathBuf },

    #[error("存储空间不足: {}", path.display())]
    InsufficientSpace { path: PathBuf },

    /// 源文件与目标文件内容不一致
    #[error("校验不一致: {} ({})", path.display(), method)]
    IntegrityMismatch {
        path: PathBuf,
        method: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("网络错误: {message}")]
    Network { message: String },

    #[error("操作已取消")]
    Cancelled,

    #[error("目标已存在同名文件: {}", path.display())]
    NameCollision { path: PathBuf },

    #[error("无效的状态转换: {from} 状态下不能执行 {action}")]
    InvalidTransition { from: String, action: &'static str },

    #[error("I/O 错误 {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// 根据 io 错误类型归类
    pub fn from_io(path: impl AsRef<Path>, err: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();

        if is_out_of_space(&err) {
            return CoreError::InsufficientSpace { path };
        }

        match err.kind() {
            io::ErrorKind::NotFound => CoreError::FileNotFound { path },
            io::ErrorKind::PermissionDenied => CoreError::FileAccessDenied { path },
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut => CoreError::Network {
                message: format!("{}: {}", path.display(), err),
            },
            _ => CoreError::Io { path, source: err },
        }
    }

    pub fn integrity(
        path: impl AsRef<Path>,
        algorithm: Option<DigestAlgorithm>,
        expected: Option<String>,
        actual: Option<String>,
    ) -> Self {
        CoreError::IntegrityMismatch {
            path: path.as_ref().to_path_buf(),
            method: algorithm
                .map(|a| a.to_string())
                .unwrap_or_else(|| "bytes".to_string()),
            expected,
            actual,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }

    /// 出错的文件路径（如果有）
    pub fn path(&self) -> Option<&Path> {
        match self {
            CoreError::FileNotFound { path }
            | CoreError::FileAccessDenied { path }
            | CoreError::InsufficientSpace { path }
            | CoreError::IntegrityMismatch { path, .. }
            | CoreError::NameCollision { path }
            | CoreError::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

// ENOSPC / EDQUOT 与 Windows 的 ERROR_HANDLE_DISK_FULL / ERROR_DISK_FULL
fn is_out_of_space(err: &io::Error) -> bool {
    match err.raw_os_error() {
        #[cfg(unix)]
        Some(code) => code == 28 || code == 122,
        #[cfg(windows)]
        Some(code) => code == 39 || code == 112,
        #[cfg(not(any(unix, windows)))]
        Some(_) => false,
        None => false,
    }
}
