//! 软件仿真 PCM 后端
//!
//! 用单调时钟模拟内核环形缓冲区的放音行为：
//! - 填充量达到 start threshold 后开始按采样率匀速放音
//! - 写入阻塞到全部帧入队（空间不足时小步睡眠等待）
//! - 放音追上写入（缓冲区被耗尽）时，先让一次占用量查询失败，
//!   再让下一次写入返回 underrun，然后自动恢复
//!
//! 行为对齐 NORESTART 模式下的内核驱动，粒度足够驱动
//! 写阈值控制器的全部路径。

use std::thread;
use std::time::{Duration, Instant};

use crate::config::OutProfile;
use crate::error::{HalError, Result};

use super::{Direction, PcmBackend, PcmDevice};

/// 仿真后端工厂
#[derive(Default)]
pub struct SimBackend;

impl SimBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PcmBackend for SimBackend {
    fn open(
        &self,
        card: u32,
        device: u32,
        direction: Direction,
        profile: &OutProfile,
    ) -> Result<Box<dyn PcmDevice>> {
        if direction != Direction::Out {
            return Err(HalError::Unsupported("sim backend is output only"));
        }
        log::info!(
            "sim pcm open: card={} device={} rate={} channels={} buffer={} frames",
            card,
            device,
            profile.rate,
            profile.channels,
            profile.buffer_capacity_frames()
        );
        Ok(Box::new(SimDevice::new(profile)))
    }
}

/// 仿真的一路 PCM 输出
pub struct SimDevice {
    rate: u32,
    channels: usize,
    period_frames: usize,
    capacity_frames: usize,
    start_threshold: usize,

    /// 当前入队帧数
    queued: usize,
    /// 是否已开始放音
    started: bool,
    /// 放音已消费、尚未从 queued 扣除的时间基准
    last_drain: Instant,
    /// 耗尽后待上报的 underrun
    underrun_pending: bool,
}

impl SimDevice {
    fn new(profile: &OutProfile) -> Self {
        Self {
            rate: profile.rate,
            channels: profile.channels as usize,
            period_frames: profile.period_frames,
            capacity_frames: profile.buffer_capacity_frames(),
            start_threshold: profile.start_threshold_frames(),
            queued: 0,
            started: false,
            last_drain: Instant::now(),
            underrun_pending: false,
        }
    }

    /// 按流逝时间扣除已放音的帧
    fn drain(&mut self) {
        let now = Instant::now();
        if !self.started {
            self.last_drain = now;
            return;
        }

        let elapsed = now.duration_since(self.last_drain);
        let drained = (elapsed.as_secs_f64() * self.rate as f64) as usize;
        if drained == 0 {
            return;
        }

        if drained >= self.queued {
            // 放音追上了写入：缓冲区耗尽
            self.queued = 0;
            self.started = false;
            self.underrun_pending = true;
            self.last_drain = now;
            log::debug!("sim pcm underrun");
        } else {
            self.queued -= drained;
            // 基准只前移已扣除帧对应的时间，保留亚帧余量
            self.last_drain += Duration::from_secs_f64(drained as f64 / self.rate as f64);
        }
    }

    /// 仿真时长：n 帧对应的播放时间
    fn frames_to_duration(&self, frames: usize) -> Duration {
        Duration::from_secs_f64(frames as f64 / self.rate as f64)
    }
}

impl PcmDevice for SimDevice {
    fn write(&mut self, samples: &[i32]) -> Result<usize> {
        let frames = samples.len() / self.channels;
        self.drain();

        if self.underrun_pending {
            self.underrun_pending = false;
            return Err(HalError::Underrun);
        }

        let mut remaining = frames;
        while remaining > 0 {
            let free = self.capacity_frames - self.queued;
            if free == 0 {
                // 等待大约一个 period 的放音再试
                let step = self
                    .frames_to_duration(self.period_frames)
                    .max(Duration::from_micros(500));
                thread::sleep(step);
                self.drain();
                continue;
            }
            let n = remaining.min(free);
            self.queued += n;
            remaining -= n;

            if !self.started && self.queued >= self.start_threshold {
                self.started = true;
                self.last_drain = Instant::now();
            }
        }

        Ok(frames)
    }

    fn avail_with_timestamp(&mut self) -> Result<(usize, Instant)> {
        self.drain();
        if self.underrun_pending {
            // 耗尽状态下时间戳无效，对齐内核驱动在 xrun 时的查询失败
            return Err(HalError::Unavailable("pcm stopped on underrun"));
        }
        Ok((self.capacity_frames - self.queued, Instant::now()))
    }

    fn buffer_capacity_frames(&self) -> usize {
        self.capacity_frames
    }
}
