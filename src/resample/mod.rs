//! 采样率转换
//!
//! 应用声明的采样率与硬件固定采样率不一致时，写路径在提交前
//! 内联做一次转换。转换器按流创建（Dormant → Active 时），
//! 随 standby 释放。
//!
//! 实现基于 rubato 的定长多项式插值器，外面包一层流式 FIFO：
//! 输入全部吸收进待处理队列，攒够一个 chunk 就处理一批，
//! 输出按调用方缓冲区容量分批取走。

use std::collections::VecDeque;

use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};

use crate::error::{HalError, Result};

/// 内部处理 chunk 的帧数
const CHUNK_FRAMES: usize = 128;

/// 转换质量档位
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConverterQuality {
    /// 线性插值，最省
    Fast,
    /// 七次多项式，质量 / 开销折中
    Default,
}

impl ConverterQuality {
    fn degree(&self) -> PolynomialDegree {
        match self {
            Self::Fast => PolynomialDegree::Linear,
            Self::Default => PolynomialDegree::Septic,
        }
    }
}

/// 采样率转换器契约
///
/// 流式语义：一次调用消费若干输入帧、产出若干输出帧，
/// 两个数量都可能小于请求值，由返回值报告。
pub trait RateConverter: Send {
    /// 转换交错 i32 样本
    ///
    /// 返回 `(消费的输入帧数, 写入 output 的输出帧数)`
    fn convert(&mut self, input: &[i32], output: &mut [i32]) -> (usize, usize);

    /// 清空内部状态
    fn reset(&mut self);

    /// 输出 / 输入采样率比
    fn ratio(&self) -> f64;
}

/// 创建转换器
pub fn create_converter(
    input_rate: u32,
    output_rate: u32,
    channels: u32,
    quality: ConverterQuality,
) -> Result<Box<dyn RateConverter>> {
    let converter = PolynomialConverter::new(input_rate, output_rate, channels, quality)?;
    Ok(Box::new(converter))
}

/// rubato FastFixedIn 外加流式缓冲的转换器
struct PolynomialConverter {
    channels: usize,
    ratio: f64,
    inner: FastFixedIn<f32>,
    /// 攒满一个 chunk 才送入 inner 的输入队列（平面格式）
    in_planar: Vec<Vec<f32>>,
    /// 已转换、等待取走的输出样本（交错格式）
    out_fifo: VecDeque<i32>,
}

impl PolynomialConverter {
    fn new(
        input_rate: u32,
        output_rate: u32,
        channels: u32,
        quality: ConverterQuality,
    ) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 || channels == 0 {
            return Err(HalError::InvalidArgument(format!(
                "bad converter config: {} -> {} Hz, {} channels",
                input_rate, output_rate, channels
            )));
        }

        let ratio = output_rate as f64 / input_rate as f64;
        let inner = FastFixedIn::<f32>::new(
            ratio,
            1.0, // 运行期不变比率
            quality.degree(),
            CHUNK_FRAMES,
            channels as usize,
        )
        .map_err(|e| HalError::ResourceExhausted(format!("resampler create failed: {}", e)))?;

        log::debug!(
            "rate converter: {} -> {} Hz, {} channels, chunk {} frames",
            input_rate,
            output_rate,
            channels,
            CHUNK_FRAMES
        );

        Ok(Self {
            channels: channels as usize,
            ratio,
            inner,
            in_planar: vec![Vec::new(); channels as usize],
            out_fifo: VecDeque::new(),
        })
    }
}

impl RateConverter for PolynomialConverter {
    fn convert(&mut self, input: &[i32], output: &mut [i32]) -> (usize, usize) {
        let frames_in = input.len() / self.channels;

        // 吸收全部输入
        for frame in 0..frames_in {
            for ch in 0..self.channels {
                self.in_planar[ch].push(s32_to_f32(input[frame * self.channels + ch]));
            }
        }

        // 攒够 chunk 就转换一批
        while self.in_planar[0].len() >= CHUNK_FRAMES {
            let chunk: Vec<Vec<f32>> = self
                .in_planar
                .iter_mut()
                .map(|ch| ch.drain(..CHUNK_FRAMES).collect())
                .collect();

            match self.inner.process(&chunk, None) {
                Ok(planar_out) => {
                    let out_frames = planar_out[0].len();
                    for frame in 0..out_frames {
                        for ch in 0..self.channels {
                            self.out_fifo.push_back(f32_to_s32(planar_out[ch][frame]));
                        }
                    }
                }
                Err(e) => {
                    log::warn!("resample chunk failed: {}", e);
                    break;
                }
            }
        }

        // 按输出缓冲区容量取走
        let cap_frames = output.len() / self.channels;
        let have_frames = self.out_fifo.len() / self.channels;
        let take_frames = cap_frames.min(have_frames);
        for (dst, sample) in output
            .iter_mut()
            .zip(self.out_fifo.drain(..take_frames * self.channels))
        {
            *dst = sample;
        }

        (frames_in, take_frames)
    }

    fn reset(&mut self) {
        for ch in &mut self.in_planar {
            ch.clear();
        }
        self.out_fifo.clear();
        self.inner.reset();
    }

    fn ratio(&self) -> f64 {
        self.ratio
    }
}

/// i32 全幅样本转 [-1, 1] 浮点
#[inline]
fn s32_to_f32(sample: i32) -> f32 {
    sample as f32 / 2_147_483_648.0
}

/// 浮点转回 i32，越界截断
#[inline]
fn f32_to_s32(sample: f32) -> i32 {
    (sample.clamp(-1.0, 1.0) * 2_147_483_647.0) as i32
}
