//! 操作状态与断点恢复
//!
//! 状态机：NotStarted -> InProgress <-> Paused -> Resuming -> InProgress -> Completed，
//! InProgress / Paused 可以转到 Cancelled 或 Failed。每次暂停都会把快照写入磁盘，
//! 恢复、取消、完成时删除快照，进程重启后仍能看到未完成的操作。

use crate::core::persist::{read_json, write_json_atomic};
use crate::error::{CoreError, CoreResult};
use crate::models::{LabelingSettings, VerificationPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationState {
    NotStarted,
    InProgress,
    Paused,
    Resuming,
    Completed,
    Cancelled,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Cancelled | OperationState::Failed
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationState::NotStarted => "not_started",
            OperationState::InProgress => "in_progress",
            OperationState::Paused => "paused",
            OperationState::Resuming => "resuming",
            OperationState::Completed => "completed",
            OperationState::Cancelled => "cancelled",
            OperationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PauseReason {
    UserRequested,
    SystemSleep,
    Backgrounded,
    LowBattery,
    Error,
}

/// 自动恢复策略
#[derive(Debug, Clone, Copy)]
pub struct ResumePolicy {
    /// 睡眠/切到后台后允许自动恢复的时间窗口
    pub auto_resume_window: Duration,
    /// 电量恢复到该比例以上才自动恢复（0.0 ~ 1.0）
    pub low_battery_threshold: f32,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self {
            auto_resume_window: Duration::from_secs(3600),
            low_battery_threshold: 0.2,
        }
    }
}

/// 恢复操作所需的上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationContext {
    pub source_root: PathBuf,
    pub destination_roots: Vec<PathBuf>,
    pub policy: VerificationPolicy,
    pub labeling: LabelingSettings,
}

/// 暂停时的进度
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseProgress {
    pub fraction: f64,
    pub files_processed: u64,
    pub files_total: u64,
}

/// 暂停快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedOperationState {
    pub operation_id: Uuid,
    pub state: OperationState,
    pub reason: PauseReason,
    pub paused_at: DateTime<Utc>,
    pub progress: PauseProgress,
    pub context: OperationContext,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateStore {
    saved_operation_states: Vec<SavedOperationState>,
}

/// 是否允许自动恢复（纯函数）
pub fn can_auto_resume(
    reason: PauseReason,
    paused_at: DateTime<Utc>,
    now: DateTime<Utc>,
    battery_level: Option<f32>,
    policy: &ResumePolicy,
) -> bool {
    match reason {
        PauseReason::SystemSleep | PauseReason::Backgrounded => {
            let elapsed = now
                .signed_duration_since(paused_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            elapsed <= policy.auto_resume_window
        }
        PauseReason::LowBattery => {
            battery_level.is_some_and(|level| level > policy.low_battery_threshold)
        }
        PauseReason::UserRequested | PauseReason::Error => false,
    }
}

/// 平台生命周期事件
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LifecycleEvent {
    WillSleep,
    DidWake,
    EnteredBackground,
    EnteredForeground,
    BatteryLow { level: f32 },
    BatteryRecovered { level: f32 },
}

/// 生命周期信号源，具体实现由平台层提供
pub trait LifecycleSignal: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent>;
}

/// 基于 broadcast 通道的信号源
pub struct ChannelLifecycleSignal {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for ChannelLifecycleSignal {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self { tx }
    }
}

impl ChannelLifecycleSignal {
    pub fn emit(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }
}

impl LifecycleSignal for ChannelLifecycleSignal {
    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

struct Inner {
    current: OperationState,
    operation_id: Option<Uuid>,
    context: Option<OperationContext>,
    progress: PauseProgress,
    pause_reason: Option<PauseReason>,
    paused_at: Option<DateTime<Utc>>,
    saved: Vec<SavedOperationState>,
}

/// 操作状态服务
pub struct OperationStateService {
    store_path: PathBuf,
    policy: ResumePolicy,
    inner: Mutex<Inner>,
    /// 串行化快照落盘，写文件期间不占用状态锁
    write_lock: Mutex<()>,
    state_tx: watch::Sender<OperationState>,
}

impl OperationStateService {
    /// 打开状态服务，读取上次进程留下的暂停快照
    pub fn open(store_path: PathBuf) -> CoreResult<Self> {
        Self::open_with_policy(store_path, ResumePolicy::default())
    }

    pub fn open_with_policy(store_path: PathBuf, policy: ResumePolicy) -> CoreResult<Self> {
        let store: StateStore = read_json(&store_path)?.unwrap_or_default();
        if !store.saved_operation_states.is_empty() {
            info!(
                "发现 {} 个未完成的暂停操作",
                store.saved_operation_states.len()
            );
        }

        let (state_tx, _) = watch::channel(OperationState::NotStarted);
        Ok(Self {
            store_path,
            policy,
            inner: Mutex::new(Inner {
                current: OperationState::NotStarted,
                operation_id: None,
                context: None,
                progress: PauseProgress::default(),
                pause_reason: None,
                paused_at: None,
                saved: store.saved_operation_states,
            }),
            write_lock: Mutex::new(()),
            state_tx,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn writing(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, saved: &[SavedOperationState]) -> CoreResult<()> {
        write_json_atomic(
            &self.store_path,
            &StateStore {
                saved_operation_states: saved.to_vec(),
            },
        )
    }

    fn set_state(&self, inner: &mut Inner, next: OperationState) {
        debug!("操作状态: {} -> {}", inner.current, next);
        inner.current = next;
        self.state_tx.send_replace(next);
    }

    fn invalid(from: OperationState, action: &'static str) -> CoreError {
        CoreError::InvalidTransition {
            from: from.to_string(),
            action,
        }
    }

    /// 删除某个操作的快照：先落盘，成功后再更新内存。调用方持有写锁
    fn drop_snapshot(&self, operation_id: Uuid) -> CoreResult<()> {
        let remaining = {
            let inner = self.lock();
            if !inner.saved.iter().any(|s| s.operation_id == operation_id) {
                return Ok(());
            }
            inner
                .saved
                .iter()
                .filter(|s| s.operation_id != operation_id)
                .cloned()
                .collect::<Vec<_>>()
        };
        self.persist(&remaining)?;
        self.lock().saved = remaining;
        Ok(())
    }

    pub fn current(&self) -> OperationState {
        self.lock().current
    }

    pub fn operation_id(&self) -> Option<Uuid> {
        self.lock().operation_id
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        self.lock().pause_reason
    }

    pub fn policy(&self) -> &ResumePolicy {
        &self.policy
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<OperationState> {
        self.state_tx.subscribe()
    }

    pub fn can_resume(&self) -> bool {
        self.lock().current == OperationState::Paused
    }

    /// 开始新操作：只允许在未开始或终态下调用
    pub fn start(&self, operation_id: Uuid, context: OperationContext) -> CoreResult<()> {
        let _writing = self.writing();
        {
            let inner = self.lock();
            if !(inner.current == OperationState::NotStarted || inner.current.is_terminal()) {
                return Err(Self::invalid(inner.current, "start"));
            }
        }

        self.drop_snapshot(operation_id)?;
        let mut inner = self.lock();
        inner.operation_id = Some(operation_id);
        inner.context = Some(context);
        inner.progress = PauseProgress::default();
        inner.pause_reason = None;
        inner.paused_at = None;
        self.set_state(&mut inner, OperationState::InProgress);

        info!("操作开始: {}", operation_id);
        Ok(())
    }

    /// 记录最新进度，暂停时写入快照
    pub fn record_progress(&self, progress: PauseProgress) {
        self.lock().progress = progress;
    }

    /// 暂停：只允许从 InProgress 进入
    pub fn pause(&self, reason: PauseReason) -> CoreResult<SavedOperationState> {
        let _writing = self.writing();
        let now = Utc::now();
        let (snapshot, mut saved) = {
            let inner = self.lock();
            if inner.current != OperationState::InProgress {
                return Err(Self::invalid(inner.current, "pause"));
            }
            let (Some(operation_id), Some(context)) = (inner.operation_id, inner.context.clone())
            else {
                return Err(Self::invalid(inner.current, "pause"));
            };
            let snapshot = SavedOperationState {
                operation_id,
                state: OperationState::Paused,
                reason,
                paused_at: now,
                progress: inner.progress,
                context,
            };
            (snapshot, inner.saved.clone())
        };

        // 快照写盘成功后才进入 Paused
        let operation_id = snapshot.operation_id;
        saved.retain(|s| s.operation_id != operation_id);
        saved.push(snapshot.clone());
        self.persist(&saved)?;

        let mut inner = self.lock();
        inner.saved = saved;
        inner.pause_reason = Some(reason);
        inner.paused_at = Some(now);
        self.set_state(&mut inner, OperationState::Paused);

        info!("操作暂停: {} ({:?})", operation_id, reason);
        Ok(snapshot)
    }

    /// 暂停期间用最新进度刷新快照（暂停时正在处理的文件完成之后调用）
    pub fn refresh_saved_progress(&self) -> CoreResult<()> {
        let _writing = self.writing();
        let saved = {
            let inner = self.lock();
            if inner.current != OperationState::Paused {
                return Ok(());
            }
            let Some(operation_id) = inner.operation_id else {
                return Ok(());
            };
            let progress = inner.progress;
            let mut saved = inner.saved.clone();
            let Some(snapshot) = saved.iter_mut().find(|s| s.operation_id == operation_id) else {
                return Ok(());
            };
            if snapshot.progress == progress {
                return Ok(());
            }
            snapshot.progress = progress;
            saved
        };

        self.persist(&saved)?;
        self.lock().saved = saved;
        Ok(())
    }

    /// 恢复：经过 Resuming 瞬态回到 InProgress
    pub fn resume(&self) -> CoreResult<()> {
        let _writing = self.writing();
        let operation_id = {
            let mut inner = self.lock();
            if inner.current != OperationState::Paused {
                return Err(Self::invalid(inner.current, "resume"));
            }
            self.set_state(&mut inner, OperationState::Resuming);
            inner.operation_id
        };

        if let Some(id) = operation_id {
            if let Err(e) = self.drop_snapshot(id) {
                // 快照删除失败不影响继续传输，下次状态变化时会再次落盘
                warn!("删除暂停快照失败: {}", e);
            }
        }

        let mut inner = self.lock();
        inner.pause_reason = None;
        inner.paused_at = None;
        self.set_state(&mut inner, OperationState::InProgress);

        info!("操作恢复: {:?}", inner.operation_id);
        Ok(())
    }

    fn finish(&self, next: OperationState, action: &'static str) -> CoreResult<()> {
        let _writing = self.writing();
        let operation_id = {
            let inner = self.lock();
            if !matches!(
                inner.current,
                OperationState::InProgress | OperationState::Paused
            ) {
                return Err(Self::invalid(inner.current, action));
            }
            inner.operation_id
        };

        if let Some(id) = operation_id {
            self.drop_snapshot(id)?;
        }
        let mut inner = self.lock();
        inner.pause_reason = None;
        inner.paused_at = None;
        self.set_state(&mut inner, next);

        info!("操作结束: {:?} -> {}", inner.operation_id, next);
        Ok(())
    }

    pub fn complete(&self) -> CoreResult<()> {
        self.finish(OperationState::Completed, "complete")
    }

    pub fn cancel(&self) -> CoreResult<()> {
        self.finish(OperationState::Cancelled, "cancel")
    }

    pub fn fail(&self) -> CoreResult<()> {
        self.finish(OperationState::Failed, "fail")
    }

    /// 当前暂停是否满足自动恢复条件
    pub fn can_auto_resume(&self, battery_level: Option<f32>) -> bool {
        let inner = self.lock();
        if inner.current != OperationState::Paused {
            return false;
        }
        match (inner.pause_reason, inner.paused_at) {
            (Some(reason), Some(paused_at)) => {
                can_auto_resume(reason, paused_at, Utc::now(), battery_level, &self.policy)
            }
            _ => false,
        }
    }

    /// 磁盘上保存的全部暂停快照
    pub fn saved_states(&self) -> Vec<SavedOperationState> {
        self.lock().saved.clone()
    }

    pub fn saved_state(&self, operation_id: Uuid) -> Option<SavedOperationState> {
        self.lock()
            .saved
            .iter()
            .find(|s| s.operation_id == operation_id)
            .cloned()
    }

    /// 丢弃一个不再需要的快照（例如用户放弃恢复上次的操作）
    pub fn discard_saved(&self, operation_id: Uuid) -> CoreResult<()> {
        let _writing = self.writing();
        self.drop_snapshot(operation_id)?;
        info!("已丢弃暂停快照: {}", operation_id);
        Ok(())
    }

    /// 处理平台事件：环境原因暂停，条件满足时自动恢复
    pub fn handle_lifecycle_event(&self, event: LifecycleEvent) -> CoreResult<()> {
        let current = self.current();
        match event {
            LifecycleEvent::WillSleep if current == OperationState::InProgress => {
                self.pause(PauseReason::SystemSleep).map(|_| ())
            }
            LifecycleEvent::EnteredBackground if current == OperationState::InProgress => {
                self.pause(PauseReason::Backgrounded).map(|_| ())
            }
            LifecycleEvent::BatteryLow { .. } if current == OperationState::InProgress => {
                self.pause(PauseReason::LowBattery).map(|_| ())
            }
            LifecycleEvent::DidWake | LifecycleEvent::EnteredForeground => {
                if self.can_auto_resume(None) {
                    self.resume()
                } else {
                    Ok(())
                }
            }
            LifecycleEvent::BatteryRecovered { level } => {
                if self.can_auto_resume(Some(level)) {
                    self.resume()
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// 后台监听生命周期信号
    pub fn spawn_lifecycle_listener(
        self: &Arc<Self>,
        signal: &dyn LifecycleSignal,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = signal.subscribe();
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        debug!("生命周期事件: {:?}", event);
                        if let Err(e) = service.handle_lifecycle_event(event) {
                            warn!("处理生命周期事件失败: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("生命周期事件积压，丢弃 {} 条", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
