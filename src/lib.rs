//! Primary Audio HAL - 输出通路核心
//!
//! 设计目标：
//! - 低可闻延迟：写阈值限流把内核缓冲占用压在目标水位
//! - 无 underrun：阈值随占用量渐进收敛，深度欠载快速恢复
//! - 格式适配内联：声道缩减和采样率转换都在写路径上完成
//!
//! 硬件侧是固定配置的环形缓冲驱动（[`pcm::PcmBackend`] 契约），
//! 上层通过 [`stream::OutputStream`] 能力接口驱动流。

pub mod config;
pub mod device;
pub mod error;
pub mod params;
pub mod pcm;
pub mod resample;
pub mod route;
pub mod stream;

pub use config::{OutProfile, SampleFormat, SourceConfig};
pub use device::{AudioDevice, StreamId};
pub use error::{HalError, Result};
pub use stream::{OutputStream, PresentationPosition, StreamOut};
