//! PCM 后端契约
//!
//! 内核环形缓冲区驱动的抽象：打开 / 写入 / 查询可写空间与时间戳 /
//! 查询容量。关闭即 Drop。真实硬件实现在本 crate 之外；
//! [`sim`] 提供一个按单调时钟放音的软件仿真，供测试和演示使用。

pub mod sim;

use std::time::Instant;

use crate::config::OutProfile;
use crate::error::Result;

pub use sim::SimBackend;

/// 数据方向
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// 后端工厂：按卡号 / 设备号打开一路 PCM
pub trait PcmBackend: Send + Sync {
    fn open(
        &self,
        card: u32,
        device: u32,
        direction: Direction,
        profile: &OutProfile,
    ) -> Result<Box<dyn PcmDevice>>;
}

/// 一路已打开的 PCM
///
/// 句柄被它的流独占持有，不允许并发访问；释放即关闭。
pub trait PcmDevice: Send {
    /// 写入交错 i32 样本，阻塞到全部入队
    ///
    /// 返回实际写入的帧数。内核缓冲区被耗尽时返回
    /// [`HalError::Underrun`](crate::HalError::Underrun)，不做任何补偿延迟。
    fn write(&mut self, samples: &[i32]) -> Result<usize>;

    /// 查询当前可写空间（帧）和配套的单调时间戳
    ///
    /// 占用量 = 容量 - 可写空间。查询失败时调用方应跳过调节
    /// （fail-open），而不是中止写入。
    fn avail_with_timestamp(&mut self) -> Result<(usize, Instant)>;

    /// 环形缓冲区总容量（帧）
    fn buffer_capacity_frames(&self) -> usize;
}
