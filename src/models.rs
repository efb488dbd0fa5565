//! 数据模型：校验策略、操作记录、单文件结果与进度事件

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::core::reporting::ErrorSummary;
use crate::core::timing::TimingSnapshot;

/// 摘要算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "").as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            _ => Err(format!("未知的摘要算法: {}", s)),
        }
    }
}

/// 校验策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum VerificationPolicy {
    /// 只比较大小
    SizeOnly,
    /// 单一摘要
    #[default]
    Standard,
    /// 多个摘要，全部一致才算通过
    Thorough,
    /// 逐字节比较
    Paranoid,
}

impl VerificationPolicy {
    /// 该策略需要计算的摘要算法列表
    pub fn algorithms(
        &self,
        standard: DigestAlgorithm,
        thorough: &[DigestAlgorithm],
    ) -> Vec<DigestAlgorithm> {
        match self {
            VerificationPolicy::Standard => vec![standard],
            VerificationPolicy::Thorough if thorough.is_empty() => vec![standard],
            VerificationPolicy::Thorough => thorough.to_vec(),
            VerificationPolicy::SizeOnly | VerificationPolicy::Paranoid => Vec::new(),
        }
    }

    /// 相对读取遍数（复制本身算 1 遍），用于耗时估算
    pub fn cost_factor(&self, thorough_count: usize) -> f64 {
        match self {
            VerificationPolicy::SizeOnly => 1.0,
            VerificationPolicy::Standard => 3.0,
            VerificationPolicy::Thorough => 1.0 + 2.0 * thorough_count.max(1) as f64,
            VerificationPolicy::Paranoid => 3.0,
        }
    }
}

impl std::fmt::Display for VerificationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationPolicy::SizeOnly => write!(f, "size-only"),
            VerificationPolicy::Standard => write!(f, "standard"),
            VerificationPolicy::Thorough => write!(f, "thorough"),
            VerificationPolicy::Paranoid => write!(f, "paranoid"),
        }
    }
}

impl FromStr for VerificationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "size" | "size-only" | "sizeonly" => Ok(VerificationPolicy::SizeOnly),
            "standard" => Ok(VerificationPolicy::Standard),
            "thorough" => Ok(VerificationPolicy::Thorough),
            "paranoid" => Ok(VerificationPolicy::Paranoid),
            _ => Err(format!("未知的校验策略: {}", s)),
        }
    }
}

/// 实际使用的校验方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "algorithm")]
pub enum VerificationMethod {
    Size,
    Digest(DigestAlgorithm),
    ByteComparison,
}

impl std::fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationMethod::Size => write!(f, "size"),
            VerificationMethod::Digest(alg) => write!(f, "{}", alg),
            VerificationMethod::ByteComparison => write!(f, "bytes"),
        }
    }
}

/// 摘要比较（忽略大小写）
pub fn digests_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// 单次校验结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub method: VerificationMethod,
    pub source_digest: Option<String>,
    pub destination_digest: Option<String>,
    pub matches: bool,
    pub processing_ms: u64,
    pub file_size: u64,
}

impl VerificationResult {
    pub fn from_digests(
        algorithm: DigestAlgorithm,
        source: String,
        destination: String,
        processing_ms: u64,
        file_size: u64,
    ) -> Self {
        let matches = digests_match(&source, &destination);
        Self {
            method: VerificationMethod::Digest(algorithm),
            source_digest: Some(source),
            destination_digest: Some(destination),
            matches,
            processing_ms,
            file_size,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.matches
    }
}

/// 目标子目录命名设置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelingSettings {
    /// 自定义目录名，为空时使用源目录名
    pub folder_name: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    /// 追加日期（YYYY-MM-DD）
    pub append_date: bool,
}

impl LabelingSettings {
    pub fn folder_name(&self, source_root: &Path, date: DateTime<Utc>) -> String {
        let base = self
            .folder_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .or_else(|| {
                source_root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "source".to_string());

        let mut name = String::new();
        if let Some(prefix) = self.prefix.as_deref().filter(|s| !s.is_empty()) {
            name.push_str(prefix);
            name.push('_');
        }
        name.push_str(&base);
        if let Some(suffix) = self.suffix.as_deref().filter(|s| !s.is_empty()) {
            name.push('_');
            name.push_str(suffix);
        }
        if self.append_date {
            name.push('_');
            name.push_str(&date.format("%Y-%m-%d").to_string());
        }

        sanitize_component(&name)
    }
}

/// 去掉路径分隔符等不能出现在单个目录名中的字符
fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "source".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preparing,
    Copying,
    Verifying,
    Completed,
}

/// 进度事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub operation_id: Uuid,
    /// 0.0 ~ 1.0
    pub fraction: f64,
    pub files_processed: u64,
    pub files_total: u64,
    pub current_file: String,
    pub destination: Option<PathBuf>,
    pub stage: Stage,
    /// 瞬时速度（字节/秒）
    pub bytes_per_second: u64,
    /// 预计剩余秒数
    pub eta_seconds: Option<u64>,
}

/// 单个 (源文件, 目标) 的处理结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOperationResult {
    pub operation_id: Uuid,
    /// 相对源根目录的路径（统一使用 /）
    pub relative_path: String,
    pub source_path: PathBuf,
    pub destination_root: PathBuf,
    pub destination_path: PathBuf,
    pub success: bool,
    pub error: Option<String>,
    pub file_size: u64,
    /// 按执行顺序记录的全部校验
    pub verifications: Vec<VerificationResult>,
    /// 上次运行已完成、本次确认目标未变化而跳过复制
    #[serde(default)]
    pub resumed: bool,
    pub processing_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl FileOperationResult {
    /// 决定结论的那次校验：第一次不一致的，否则最后一次
    pub fn verification(&self) -> Option<&VerificationResult> {
        self.verifications
            .iter()
            .find(|v| !v.matches)
            .or_else(|| self.verifications.last())
    }

    pub fn is_verified(&self) -> bool {
        !self.verifications.is_empty() && self.verifications.iter().all(|v| v.matches)
    }
}

/// 结果行的主键
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultKey {
    pub path: String,
    pub destination: String,
}

/// FileOperationResult 的扁平化形式，用于持久化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub path: String,
    pub destination: String,
    pub success: bool,
    pub error: Option<String>,
    pub file_size: u64,
    pub verification_method: Option<VerificationMethod>,
    pub source_digest: Option<String>,
    pub destination_digest: Option<String>,
    pub matches: Option<bool>,
    #[serde(default)]
    pub resumed: bool,
    pub processing_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl ResultRow {
    pub fn key(&self) -> ResultKey {
        ResultKey {
            path: self.path.clone(),
            destination: self.destination.clone(),
        }
    }
}

impl From<&FileOperationResult> for ResultRow {
    fn from(result: &FileOperationResult) -> Self {
        let verification = result.verification();
        ResultRow {
            path: result.relative_path.clone(),
            destination: result.destination_root.to_string_lossy().into_owned(),
            success: result.success,
            error: result.error.clone(),
            file_size: result.file_size,
            verification_method: verification.map(|v| v.method),
            source_digest: verification.and_then(|v| v.source_digest.clone()),
            destination_digest: verification.and_then(|v| v.destination_digest.clone()),
            matches: verification.map(|v| v.matches),
            resumed: result.resumed,
            processing_ms: result.processing_ms,
            completed_at: result.completed_at,
        }
    }
}

/// 一次完整的复制校验操作
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOperation {
    pub id: Uuid,
    pub source_root: PathBuf,
    pub destination_roots: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub policy: VerificationPolicy,
    pub labeling: LabelingSettings,
    pub results: Vec<ResultRow>,
    pub cancelled: bool,
    pub errors: ErrorSummary,
    pub timing: TimingSnapshot,
}

impl FileOperation {
    pub fn succeeded_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.results.iter().filter(|r| r.success).map(|r| r.file_size).sum()
    }
}
