//! 错误报告服务
//!
//! 把原始错误按固定决策表归类为 (类别, 严重程度, 可恢复性, 恢复建议)。
//! 面向用户只展示归类后的信息，原始错误仅作为技术细节保留。

use crate::error::CoreError;
use crate::models::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    FileSystem,
    DataIntegrity,
    Storage,
    Network,
    Operation,
    Warning,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryAction {
    Retry,
    CheckPermissions,
    CheckSourceMedia,
    FreeUpSpace,
    ChooseAnotherDestination,
    CheckNetworkConnection,
    RecopyFile,
    ResumeOperation,
    RenameFile,
    ContactSupport,
}

impl RecoveryAction {
    pub fn description(&self) -> &'static str {
        match self {
            RecoveryAction::Retry => "重试该操作",
            RecoveryAction::CheckPermissions => "检查文件和目录的访问权限",
            RecoveryAction::CheckSourceMedia => "确认源存储卡或磁盘仍然连接",
            RecoveryAction::FreeUpSpace => "清理目标磁盘空间",
            RecoveryAction::ChooseAnotherDestination => "选择其他目标位置",
            RecoveryAction::CheckNetworkConnection => "检查网络存储连接",
            RecoveryAction::RecopyFile => "重新复制该文件",
            RecoveryAction::ResumeOperation => "重新开始或继续操作",
            RecoveryAction::RenameFile => "重命名冲突的文件",
            RecoveryAction::ContactSupport => "保存日志并联系支持",
        }
    }
}

/// 错误上下文
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub file_path: Option<PathBuf>,
    pub stage: Option<Stage>,
}

impl ErrorContext {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: Some(path.into()),
            stage: None,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    pub technical_detail: Option<String>,
    pub recovery_actions: Vec<RecoveryAction>,
    pub file_path: Option<PathBuf>,
    pub recoverable: bool,
}

/// 决策表的输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub actions: Vec<RecoveryAction>,
    pub message: &'static str,
}

/// 错误归类决策表
pub fn classify(error: &CoreError) -> Classification {
    use ErrorCategory::*;
    use ErrorSeverity::*;
    use RecoveryAction::*;

    let (category, severity, recoverable, actions, message) = match error {
        CoreError::FileAccessDenied { .. } => (
            FileSystem,
            Medium,
            true,
            vec![CheckPermissions, Retry],
            "没有访问该文件或目录的权限",
        ),
        CoreError::FileNotFound { .. } => (
            FileSystem,
            Medium,
            true,
            vec![CheckSourceMedia, Retry],
            "文件不存在或已被移除",
        ),
        CoreError::Io { .. } => (
            FileSystem,
            Medium,
            true,
            vec![Retry, CheckSourceMedia],
            "读写文件时发生错误",
        ),
        CoreError::InsufficientSpace { .. } => (
            Storage,
            Critical,
            true,
            vec![FreeUpSpace, ChooseAnotherDestination],
            "目标磁盘空间不足",
        ),
        CoreError::IntegrityMismatch { .. } => (
            DataIntegrity,
            Critical,
            true,
            vec![RecopyFile, CheckSourceMedia],
            "校验失败：目标文件与源文件不一致",
        ),
        CoreError::Network { .. } => (
            Network,
            Medium,
            true,
            vec![CheckNetworkConnection, Retry],
            "访问网络存储时出错",
        ),
        CoreError::Cancelled => (
            Operation,
            Low,
            true,
            vec![ResumeOperation],
            "操作已被取消",
        ),
        CoreError::NameCollision { .. } => (
            Warning,
            Low,
            true,
            vec![RenameFile],
            "目标位置已存在同名文件",
        ),
        CoreError::InvalidTransition { .. } | CoreError::Serialization(_) => (
            Unknown,
            Medium,
            false,
            vec![ContactSupport],
            "发生未知错误",
        ),
    };

    Classification {
        category,
        severity,
        recoverable,
        actions,
        message,
    }
}

/// 整体结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationOutcome {
    Passed,
    PassedWithWarnings,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub operation_id: Uuid,
    pub total: usize,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub by_severity: BTreeMap<ErrorSeverity, usize>,
    pub first_error_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub reports: Vec<ErrorReport>,
}

impl ErrorSummary {
    pub fn outcome(&self) -> OperationOutcome {
        let non_warning = self
            .by_category
            .iter()
            .any(|(category, count)| *category != ErrorCategory::Warning && *count > 0);
        if non_warning {
            OperationOutcome::Failed
        } else if self.total > 0 {
            OperationOutcome::PassedWithWarnings
        } else {
            OperationOutcome::Passed
        }
    }

    pub fn count(&self, category: ErrorCategory) -> usize {
        self.by_category.get(&category).copied().unwrap_or(0)
    }

    pub fn has_critical(&self) -> bool {
        self.by_severity
            .get(&ErrorSeverity::Critical)
            .is_some_and(|n| *n > 0)
    }
}

/// 单次操作的错误收集器
pub struct ErrorReportingService {
    operation_id: Uuid,
    reports: Mutex<Vec<ErrorReport>>,
}

impl ErrorReportingService {
    pub fn new(operation_id: Uuid) -> Self {
        Self {
            operation_id,
            reports: Mutex::new(Vec::new()),
        }
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    fn push(&self, report: ErrorReport) {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(report);
    }

    /// 归类并记录一个错误
    pub fn report(&self, error: &CoreError, context: ErrorContext) -> ErrorReport {
        let class = classify(error);
        let file_path = context
            .file_path
            .or_else(|| error.path().map(|p| p.to_path_buf()));

        let report = ErrorReport {
            id: Uuid::new_v4(),
            operation_id: self.operation_id,
            timestamp: Utc::now(),
            category: class.category,
            severity: class.severity,
            message: class.message.to_string(),
            technical_detail: Some(match context.stage {
                Some(stage) => format!("[{:?}] {}", stage, error),
                None => error.to_string(),
            }),
            recovery_actions: class.actions,
            file_path,
            recoverable: class.recoverable,
        };

        match report.severity {
            ErrorSeverity::Critical => warn!("严重错误 ({:?}): {}", report.category, error),
            _ => info!("记录错误 ({:?}): {}", report.category, error),
        }

        self.push(report.clone());
        report
    }

    /// 记录非致命提示
    pub fn report_warning(&self, message: impl Into<String>, context: ErrorContext) -> ErrorReport {
        let report = ErrorReport {
            id: Uuid::new_v4(),
            operation_id: self.operation_id,
            timestamp: Utc::now(),
            category: ErrorCategory::Warning,
            severity: ErrorSeverity::Low,
            message: message.into(),
            technical_detail: None,
            recovery_actions: Vec::new(),
            file_path: context.file_path,
            recoverable: true,
        };
        self.push(report.clone());
        report
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 汇总全部错误
    pub fn complete(&self) -> ErrorSummary {
        let reports = self.reports();
        let mut summary = ErrorSummary {
            operation_id: self.operation_id,
            total: reports.len(),
            ..Default::default()
        };

        for report in &reports {
            *summary.by_category.entry(report.category).or_default() += 1;
            *summary.by_severity.entry(report.severity).or_default() += 1;
        }
        summary.first_error_at = reports.iter().map(|r| r.timestamp).min();
        summary.last_error_at = reports.iter().map(|r| r.timestamp).max();
        summary.reports = reports;

        summary
    }
}
