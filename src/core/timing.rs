//! 计时与吞吐统计

use crate::models::{Stage, VerificationPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// 可序列化的计时快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingSnapshot {
    /// 有效耗时（不含暂停时间），毫秒
    pub elapsed_ms: u64,
    pub paused_ms: u64,
    pub bytes_processed: u64,
    pub files_processed: u64,
    pub current_bytes_per_second: u64,
    pub average_bytes_per_second: u64,
    pub peak_bytes_per_second: u64,
    pub stage_ms: BTreeMap<Stage, u64>,
}

#[derive(Debug, Default)]
pub struct TimingTracker {
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    paused_since: Option<Instant>,
    paused_total: Duration,
    last_sample: Option<(Instant, u64)>,
    bytes_processed: u64,
    files_processed: u64,
    current_bps: f64,
    peak_bps: f64,
    stage: Option<(Stage, Instant)>,
    stage_totals: BTreeMap<Stage, Duration>,
}

impl TimingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, now: Instant) {
        *self = Self::default();
        self.started_at = Some(now);
        self.last_sample = Some((now, 0));
    }

    /// 切换阶段，累计上一阶段的耗时
    pub fn enter_stage(&mut self, stage: Stage) {
        self.enter_stage_at(stage, Instant::now());
    }

    pub fn enter_stage_at(&mut self, stage: Stage, now: Instant) {
        if let Some((current, since)) = self.stage.take() {
            if current == stage {
                self.stage = Some((current, since));
                return;
            }
            *self.stage_totals.entry(current).or_default() += now.saturating_duration_since(since);
        }
        self.stage = Some((stage, now));
    }

    /// 记录一个文件处理完成，返回瞬时速度（字节/秒）
    pub fn record_file(&mut self, bytes: u64) -> u64 {
        self.record_file_at(bytes, Instant::now())
    }

    pub fn record_file_at(&mut self, bytes: u64, now: Instant) -> u64 {
        self.files_processed += 1;
        self.bytes_processed += bytes;

        if let Some((last_time, last_bytes)) = self.last_sample {
            let elapsed = now.saturating_duration_since(last_time).as_secs_f64();
            if elapsed > 0.0 {
                self.current_bps = (self.bytes_processed - last_bytes) as f64 / elapsed;
                self.peak_bps = self.peak_bps.max(self.current_bps);
            }
        }
        self.last_sample = Some((now, self.bytes_processed));

        self.current_bps as u64
    }

    pub fn pause(&mut self) {
        self.pause_at(Instant::now());
    }

    pub fn pause_at(&mut self, now: Instant) {
        if self.paused_since.is_none() {
            self.paused_since = Some(now);
        }
    }

    pub fn resume(&mut self) {
        self.resume_at(Instant::now());
    }

    pub fn resume_at(&mut self, now: Instant) {
        if let Some(since) = self.paused_since.take() {
            let paused = now.saturating_duration_since(since);
            self.paused_total += paused;
            // 暂停期间不计入速度采样
            if let Some((time, bytes)) = self.last_sample {
                self.last_sample = Some((time + paused, bytes));
            }
            if let Some((stage, stage_since)) = self.stage {
                self.stage = Some((stage, stage_since + paused));
            }
        }
    }

    pub fn finish(&mut self) {
        self.finish_at(Instant::now());
    }

    pub fn finish_at(&mut self, now: Instant) {
        self.resume_at(now);
        self.enter_stage_at(Stage::Completed, now);
        self.finished_at = Some(now);
    }

    /// 有效耗时（不含暂停）
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        let Some(start) = self.started_at else {
            return Duration::ZERO;
        };
        let end = self.finished_at.unwrap_or(now);
        let mut paused = self.paused_total;
        if let Some(since) = self.paused_since {
            paused += end.saturating_duration_since(since);
        }
        end.saturating_duration_since(start).saturating_sub(paused)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    pub fn average_bps_at(&self, now: Instant) -> u64 {
        let secs = self.elapsed_at(now).as_secs_f64();
        if secs > 0.0 {
            (self.bytes_processed as f64 / secs) as u64
        } else {
            0
        }
    }

    pub fn current_bps(&self) -> u64 {
        self.current_bps as u64
    }

    pub fn peak_bps(&self) -> u64 {
        self.peak_bps as u64
    }

    /// 剩余时间：剩余文件数 × 已观测的平均单文件耗时
    pub fn eta_at(&self, files_remaining: u64, now: Instant) -> Option<Duration> {
        if self.files_processed == 0 {
            return None;
        }
        let per_file = self.elapsed_at(now).as_secs_f64() / self.files_processed as f64;
        Some(Duration::from_secs_f64(per_file * files_remaining as f64))
    }

    pub fn eta(&self, files_remaining: u64) -> Option<Duration> {
        self.eta_at(files_remaining, Instant::now())
    }

    /// 各阶段累计耗时（含当前阶段已进行的部分）
    pub fn stage_breakdown_at(&self, now: Instant) -> BTreeMap<Stage, Duration> {
        let mut totals = self.stage_totals.clone();
        if let Some((stage, since)) = self.stage {
            let end = self.paused_since.unwrap_or(now);
            *totals.entry(stage).or_default() += end.saturating_duration_since(since);
        }
        totals
    }

    pub fn snapshot(&self) -> TimingSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> TimingSnapshot {
        let mut paused = self.paused_total;
        if let Some(since) = self.paused_since {
            paused += now.saturating_duration_since(since);
        }
        TimingSnapshot {
            elapsed_ms: self.elapsed_at(now).as_millis() as u64,
            paused_ms: paused.as_millis() as u64,
            bytes_processed: self.bytes_processed,
            files_processed: self.files_processed,
            current_bytes_per_second: self.current_bps(),
            average_bytes_per_second: self.average_bps_at(now),
            peak_bytes_per_second: self.peak_bps(),
            stage_ms: self
                .stage_breakdown_at(now)
                .into_iter()
                .map(|(stage, d)| (stage, d.as_millis() as u64))
                .collect(),
        }
    }

    /// 开始前的耗时估算
    pub fn estimate_duration(
        total_bytes: u64,
        policy: VerificationPolicy,
        thorough_count: usize,
        bytes_per_second: u64,
    ) -> Option<Duration> {
        if bytes_per_second == 0 {
            return None;
        }
        let passes = policy.cost_factor(thorough_count);
        Some(Duration::from_secs_f64(
            total_bytes as f64 * passes / bytes_per_second as f64,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_and_peak() {
        let t0 = Instant::now();
        let mut tracker = TimingTracker::new();
        tracker.start_at(t0);

        let speed = tracker.record_file_at(1000, t0 + Duration::from_secs(1));
        assert_eq!(speed, 1000);
        let speed = tracker.record_file_at(4000, t0 + Duration::from_secs(2));
        assert_eq!(speed, 4000);
        let speed = tracker.record_file_at(1000, t0 + Duration::from_secs(4));
        assert_eq!(speed, 500);

        assert_eq!(tracker.peak_bps(), 4000);
        assert_eq!(tracker.average_bps_at(t0 + Duration::from_secs(4)), 1500);
    }

    #[test]
    fn test_pause_excluded_from_elapsed() {
        let t0 = Instant::now();
        let mut tracker = TimingTracker::new();
        tracker.start_at(t0);
        tracker.pause_at(t0 + Duration::from_secs(2));
        tracker.resume_at(t0 + Duration::from_secs(12));

        assert_eq!(tracker.elapsed_at(t0 + Duration::from_secs(15)), Duration::from_secs(5));
        let snap = tracker.snapshot_at(t0 + Duration::from_secs(15));
        assert_eq!(snap.paused_ms, 10_000);
    }

    #[test]
    fn test_eta_from_average_file_time() {
        let t0 = Instant::now();
        let mut tracker = TimingTracker::new();
        tracker.start_at(t0);
        assert!(tracker.eta_at(10, t0).is_none());

        tracker.record_file_at(10, t0 + Duration::from_secs(2));
        tracker.record_file_at(10, t0 + Duration::from_secs(4));
        let eta = tracker.eta_at(3, t0 + Duration::from_secs(4)).unwrap();
        assert_eq!(eta, Duration::from_secs(6));
    }

    #[test]
    fn test_stage_breakdown() {
        let t0 = Instant::now();
        let mut tracker = TimingTracker::new();
        tracker.start_at(t0);
        tracker.enter_stage_at(Stage::Preparing, t0);
        tracker.enter_stage_at(Stage::Copying, t0 + Duration::from_secs(1));
        tracker.enter_stage_at(Stage::Verifying, t0 + Duration::from_secs(4));
        tracker.finish_at(t0 + Duration::from_secs(6));

        let stages = tracker.stage_breakdown_at(t0 + Duration::from_secs(6));
        assert_eq!(stages[&Stage::Preparing], Duration::from_secs(1));
        assert_eq!(stages[&Stage::Copying], Duration::from_secs(3));
        assert_eq!(stages[&Stage::Verifying], Duration::from_secs(2));
    }

    #[test]
    fn test_estimate_duration_scales_with_policy() {
        let size_only =
            TimingTracker::estimate_duration(1000, VerificationPolicy::SizeOnly, 0, 100).unwrap();
        let standard =
            TimingTracker::estimate_duration(1000, VerificationPolicy::Standard, 0, 100).unwrap();
        assert_eq!(size_only, Duration::from_secs(10));
        assert_eq!(standard, Duration::from_secs(30));
        assert!(TimingTracker::estimate_duration(1000, VerificationPolicy::Paranoid, 0, 0).is_none());
    }
}
