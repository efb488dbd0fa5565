//! 平台交互（弹窗、打开链接）
//!
//! 核心只在操作最终失败或需要打开报告时调用，不会等待用户响应。

use crate::core::reporting::{ErrorReport, ErrorSeverity};
use std::sync::Mutex;
use tracing::{error, info, warn};

pub trait PlatformManager: Send + Sync {
    fn present_alert(&self, title: &str, message: &str);

    fn present_error(&self, report: &ErrorReport);

    fn open_url(&self, url: &str) -> bool;
}

/// 无界面环境：全部写入日志
#[derive(Debug, Default)]
pub struct LogPlatform;

impl PlatformManager for LogPlatform {
    fn present_alert(&self, title: &str, message: &str) {
        info!("[{}] {}", title, message);
    }

    fn present_error(&self, report: &ErrorReport) {
        let actions: Vec<&str> = report
            .recovery_actions
            .iter()
            .map(|a| a.description())
            .collect();
        match report.severity {
            ErrorSeverity::Critical => error!(
                "{} ({:?}) 建议: {}",
                report.message,
                report.file_path,
                actions.join("；")
            ),
            _ => warn!(
                "{} ({:?}) 建议: {}",
                report.message,
                report.file_path,
                actions.join("；")
            ),
        }
    }

    fn open_url(&self, url: &str) -> bool {
        info!("请手动打开: {}", url);
        false
    }
}

/// 记录所有调用，便于检查核心何时向用户展示信息
#[derive(Debug, Default)]
pub struct RecordingPlatform {
    alerts: Mutex<Vec<String>>,
    errors: Mutex<Vec<ErrorReport>>,
}

impl RecordingPlatform {
    pub fn alerts(&self) -> Vec<String> {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn errors(&self) -> Vec<ErrorReport> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl PlatformManager for RecordingPlatform {
    fn present_alert(&self, title: &str, message: &str) {
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("{}: {}", title, message));
    }

    fn present_error(&self, report: &ErrorReport) {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(report.clone());
    }

    fn open_url(&self, _url: &str) -> bool {
        false
    }
}
