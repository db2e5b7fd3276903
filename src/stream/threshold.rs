//! 写阈值控制器
//!
//! 目标：内核环形缓冲区既不能放空（underrun → 可闻的爆音），
//! 也不能无限堆积（端到端延迟失控）。控制器维护两个量：
//!
//! - `target`: 当前缓冲模式（短 / 长）对应的目标占用量
//! - `current`: 实际用于限流的阈值，向 target 以每次写调用
//!   至多 1/4 period 的步长收敛，避免延迟突变产生可闻伪影
//!
//! 两个例外允许跳变：
//! - 刚激活（模式 Unknown）时阈值直接就位
//! - 深度欠载（占用量比 target 低出一个短缓冲窗口以上）时
//!   贴到当前占用量上方，快速恢复而不是慢速爬升

use std::time::Duration;

use crate::config::OutProfile;

/// 占用量超阈值时，低于此时长的等待不值得睡，直接放行
pub const MIN_WRITE_SLEEP: Duration = Duration::from_millis(1);

/// 缓冲模式
///
/// Unknown 只出现在激活之后、第一次模式判定之前
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferMode {
    Unknown,
    Short,
    Long,
}

/// 阈值状态机
#[derive(Debug)]
pub struct ThresholdController {
    period_frames: usize,
    short_periods: usize,
    long_periods: usize,
    rate: u32,

    mode: BufferMode,
    target: usize,
    current: usize,
}

impl ThresholdController {
    pub fn new(profile: &OutProfile) -> Self {
        Self {
            period_frames: profile.period_frames,
            short_periods: profile.short_period_count,
            long_periods: profile.long_period_count,
            rate: profile.rate,
            mode: BufferMode::Unknown,
            target: 0,
            current: 0,
        }
    }

    #[inline]
    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    #[inline]
    pub fn current_threshold(&self) -> usize {
        self.current
    }

    #[inline]
    pub fn target_threshold(&self) -> usize {
        self.target
    }

    /// 回到 Unknown（standby 时调用）
    ///
    /// 阈值数值保留，下一次模式判定会重新快照
    pub fn reset(&mut self) {
        self.mode = BufferMode::Unknown;
    }

    /// 按本次写调用期望的缓冲模式更新目标阈值
    ///
    /// `want` 只能是 Short 或 Long。模式未变化时什么都不做；
    /// 从 Unknown 进入任何模式时 current 直接取 target。
    pub fn select_mode(&mut self, want: BufferMode) {
        debug_assert!(want != BufferMode::Unknown);
        if want == self.mode {
            return;
        }

        let periods = if want == BufferMode::Long {
            self.long_periods
        } else {
            self.short_periods
        };
        self.target = self.period_frames * periods;
        if self.mode == BufferMode::Unknown {
            self.current = self.target;
        }
        self.mode = want;

        log::debug!(
            "buffer mode {:?}: target {} frames, current {} frames",
            want,
            self.target,
            self.current
        );
    }

    /// 占用量超过阈值时需要等待的时长
    ///
    /// 返回 None 表示不等：占用量未超，或按采样率换算出的
    /// 等待时长低于最小粒度（此时继续轮询只会空转）。
    pub fn sleep_for_occupancy(&self, occupancy: usize) -> Option<Duration> {
        if occupancy <= self.current {
            return None;
        }
        let us = (occupancy - self.current) as u64 * 1_000_000 / self.rate as u64;
        let sleep = Duration::from_micros(us);
        if sleep < MIN_WRITE_SLEEP {
            return None;
        }
        Some(sleep)
    }

    /// 限流之后，把 current 向 target 收敛一步
    ///
    /// 阈值相等且占用量深度欠载时改为贴靠占用量的跳变
    pub fn adapt(&mut self, occupancy: usize) {
        let step = self.period_frames / 4;

        if self.current > self.target {
            self.current = self.current.saturating_sub(step).max(self.target);
        } else if self.current < self.target {
            self.current = (self.current + step).min(self.target);
        } else if occupancy < self.target
            && self.target - occupancy > self.period_frames * self.short_periods
        {
            self.current = (occupancy / self.period_frames + 1) * self.period_frames + step;
            log::debug!(
                "deep underrun recovery: occupancy {} frames, threshold snapped to {}",
                occupancy,
                self.current
            );
        }
    }
}
