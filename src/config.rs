//! 硬件输出配置
//!
//! 硬件侧参数是固定的：一个主输出 profile（扬声器 / 耳机）和一个
//! 窄带 SCO profile。配置在设备构造时确定，之后只读，
//! 按引用传入流的激活路径，不存在任何进程级可变单例。

use std::time::Duration;

/// 样本编码格式（little-endian PCM）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    S16Le,
    S32Le,
}

impl SampleFormat {
    /// 每样本字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::S16Le => 2,
            Self::S32Le => 4,
        }
    }

    /// 将原始字节解码为 i32 样本（左对齐到 32-bit 高位）
    ///
    /// - 16-bit: 占据 bit[31:16]
    /// - 32-bit: 占据 bit[31:0]
    ///
    /// 输出缓冲区会被清空后重新填充，尾部不足一个样本的字节被忽略。
    pub fn decode_into(&self, bytes: &[u8], output: &mut Vec<i32>) {
        output.clear();
        match self {
            Self::S16Le => {
                output.reserve(bytes.len() / 2);
                for chunk in bytes.chunks_exact(2) {
                    let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
                    output.push((sample as i32) << 16);
                }
            }
            Self::S32Le => {
                output.reserve(bytes.len() / 4);
                for chunk in bytes.chunks_exact(4) {
                    output.push(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                }
            }
        }
    }
}

/// 一路 PCM 输出的硬件描述
///
/// `period_frames` 是内核驱动的传输粒度；环形缓冲区总容量为
/// `period_frames * long_period_count`。短 / 长两档周期数对应
/// 写阈值控制器的两种缓冲模式。
#[derive(Clone, Debug)]
pub struct OutProfile {
    /// 声道数
    pub channels: u32,
    /// 固定采样率 (Hz)
    pub rate: u32,
    /// 单个 period 的帧数
    pub period_frames: usize,
    /// 短缓冲模式的 period 数
    pub short_period_count: usize,
    /// 长缓冲模式的 period 数（同时决定环形缓冲区容量）
    pub long_period_count: usize,
    /// 硬件侧样本格式
    pub format: SampleFormat,
}

impl OutProfile {
    /// 主输出：扬声器 / 有线耳机
    pub fn primary() -> Self {
        Self {
            channels: 2,
            rate: 48000,
            period_frames: 128,
            short_period_count: 2,
            long_period_count: 8,
            format: SampleFormat::S32Le,
        }
    }

    /// 窄带 SCO 语音输出
    ///
    /// SCO 链路没有占用量反馈，写路径对它跳过整个调节环节
    pub fn sco() -> Self {
        Self {
            channels: 1,
            rate: 8000,
            period_frames: 128,
            short_period_count: 2,
            long_period_count: 2,
            format: SampleFormat::S16Le,
        }
    }

    /// 环形缓冲区总容量（帧）
    #[inline]
    pub fn buffer_capacity_frames(&self) -> usize {
        self.period_frames * self.long_period_count
    }

    /// 内核开始放音的填充阈值（帧）
    #[inline]
    pub fn start_threshold_frames(&self) -> usize {
        self.period_frames * self.short_period_count
    }

    /// 硬件侧每帧字节数
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }

    /// 短缓冲模式的名义延迟（毫秒）
    #[inline]
    pub fn short_latency_ms(&self) -> u32 {
        (self.period_frames * self.short_period_count * 1000 / self.rate as usize) as u32
    }

    /// 单次写调用允许的最大累计睡眠时长
    ///
    /// 取最大缓冲窗口（长缓冲整个环）换算成时间，超出即放弃等待
    #[inline]
    pub fn max_write_sleep(&self) -> Duration {
        let us = self.period_frames as u64 * self.long_period_count as u64 * 1_000_000
            / self.rate as u64;
        Duration::from_micros(us)
    }
}

/// 上层应用声明的流格式
///
/// 格式固定为 32-bit PCM；采样率 / 声道数可以与硬件不一致，
/// 差异在写路径上由格式适配环节消化。
#[derive(Clone, Copy, Debug)]
pub struct SourceConfig {
    pub sample_rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
}

impl SourceConfig {
    pub fn new(sample_rate: u32, channels: u32) -> Self {
        Self {
            sample_rate,
            channels,
            format: SampleFormat::S32Le,
        }
    }

    /// 应用侧每帧字节数
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }
}
