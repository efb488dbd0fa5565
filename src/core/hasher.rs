//! 摘要计算与逐字节比较
//!
//! 按固定大小分块流式读取，内存占用与文件大小无关。每块读完后上报进度并
//! 让出执行权，取消标志在块边界检查。摘要计算不保存任何中间状态。

use crate::core::cache::ChecksumCache;
use crate::error::{CoreError, CoreResult};
use crate::models::DigestAlgorithm;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 默认分块大小 64KB
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// 进度回调，参数为 0.0 ~ 1.0
pub type ProgressFn<'a> = Option<&'a (dyn Fn(f64) + Send + Sync)>;

enum DigestState {
    Md5(md5::Context),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl DigestState {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => DigestState::Md5(md5::Context::new()),
            DigestAlgorithm::Sha1 => DigestState::Sha1(<sha1::Sha1 as sha1::Digest>::new()),
            DigestAlgorithm::Sha256 => DigestState::Sha256(<sha2::Sha256 as sha2::Digest>::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            DigestState::Md5(ctx) => ctx.consume(data),
            DigestState::Sha1(h) => sha1::Digest::update(h, data),
            DigestState::Sha256(h) => sha2::Digest::update(h, data),
        }
    }

    fn finalize(self) -> String {
        match self {
            DigestState::Md5(ctx) => format!("{:x}", ctx.compute()),
            DigestState::Sha1(h) => format!("{:x}", sha1::Digest::finalize(h)),
            DigestState::Sha256(h) => format!("{:x}", sha2::Digest::finalize(h)),
        }
    }
}

/// 尽量填满缓冲区，返回实际读取的字节数（0 表示 EOF）
async fn read_chunk(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn report(progress: ProgressFn<'_>, done: u64, total: u64) {
    if let Some(cb) = progress {
        let fraction = if total == 0 {
            1.0
        } else {
            (done as f64 / total as f64).min(1.0)
        };
        cb(fraction);
    }
}

/// 流式计算文件摘要（十六进制小写）
pub async fn digest_file(
    path: &Path,
    algorithm: DigestAlgorithm,
    chunk_size: usize,
    progress: ProgressFn<'_>,
    cancel: &CancellationToken,
) -> CoreResult<String> {
    let mut file = File::open(path)
        .await
        .map_err(|e| CoreError::from_io(path, e))?;
    let total = file
        .metadata()
        .await
        .map_err(|e| CoreError::from_io(path, e))?
        .len();

    let mut state = DigestState::new(algorithm);
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut done = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let n = read_chunk(&mut file, &mut buf)
            .await
            .map_err(|e| CoreError::from_io(path, e))?;
        if n == 0 {
            break;
        }

        state.update(&buf[..n]);
        done += n as u64;
        report(progress, done, total);

        tokio::task::yield_now().await;
    }

    report(progress, total, total);
    Ok(state.finalize())
}

/// 逐字节比较两个文件，大小不同时直接返回 false
pub async fn compare_bytes(
    a: &Path,
    b: &Path,
    chunk_size: usize,
    progress: ProgressFn<'_>,
    cancel: &CancellationToken,
) -> CoreResult<bool> {
    let size_a = tokio::fs::metadata(a)
        .await
        .map_err(|e| CoreError::from_io(a, e))?
        .len();
    let size_b = tokio::fs::metadata(b)
        .await
        .map_err(|e| CoreError::from_io(b, e))?
        .len();

    if size_a != size_b {
        debug!("大小不同 ({} != {})，跳过逐字节比较: {:?}", size_a, size_b, b);
        return Ok(false);
    }

    let mut file_a = File::open(a).await.map_err(|e| CoreError::from_io(a, e))?;
    let mut file_b = File::open(b).await.map_err(|e| CoreError::from_io(b, e))?;

    let chunk_size = chunk_size.max(1);
    let mut buf_a = vec![0u8; chunk_size];
    let mut buf_b = vec![0u8; chunk_size];
    let mut done = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let n_a = read_chunk(&mut file_a, &mut buf_a)
            .await
            .map_err(|e| CoreError::from_io(a, e))?;
        let n_b = read_chunk(&mut file_b, &mut buf_b)
            .await
            .map_err(|e| CoreError::from_io(b, e))?;

        if n_a != n_b || buf_a[..n_a] != buf_b[..n_b] {
            debug!("第 {} 字节附近内容不同: {:?}", done, b);
            return Ok(false);
        }
        if n_a == 0 {
            break;
        }

        done += n_a as u64;
        report(progress, done, size_a);

        tokio::task::yield_now().await;
    }

    report(progress, size_a, size_a);
    Ok(true)
}

/// 摘要计算次数统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HasherStats {
    /// 实际读取文件计算的次数
    pub computed: u64,
    pub cache_hits: u64,
}

#[derive(Default)]
struct Counters {
    computed: AtomicU64,
    cache_hits: AtomicU64,
}

/// 带缓存的摘要服务
#[derive(Clone)]
pub struct FileHasher {
    cache: Option<Arc<ChecksumCache>>,
    chunk_size: usize,
    counters: Arc<Counters>,
}

impl Default for FileHasher {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl FileHasher {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            cache: None,
            chunk_size: chunk_size.max(1),
            counters: Arc::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ChecksumCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn stats(&self) -> HasherStats {
        HasherStats {
            computed: self.counters.computed.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// 计算摘要，优先使用缓存
    pub async fn digest(
        &self,
        path: &Path,
        algorithm: DigestAlgorithm,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> CoreResult<String> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(path, algorithm).await {
                debug!("摘要缓存命中: {:?} ({})", path, algorithm);
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                report(progress, 1, 1);
                return Ok(hit);
            }
        }

        self.digest_fresh(path, algorithm, progress, cancel).await
    }

    /// 忽略缓存重新计算，结果写回缓存
    pub async fn digest_fresh(
        &self,
        path: &Path,
        algorithm: DigestAlgorithm,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> CoreResult<String> {
        let digest = digest_file(path, algorithm, self.chunk_size, progress, cancel).await?;
        self.counters.computed.fetch_add(1, Ordering::Relaxed);

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set(&digest, path, algorithm).await {
                warn!("写入摘要缓存失败: {:?} - {}", path, e);
            }
        }

        Ok(digest)
    }

    pub async fn compare_bytes(
        &self,
        a: &Path,
        b: &Path,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> CoreResult<bool> {
        compare_bytes(a, b, self.chunk_size, progress, cancel).await
    }
}
