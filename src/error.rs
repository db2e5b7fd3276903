//! HAL 错误分类
//!
//! 四类核心错误，全部可恢复，没有进程级致命错误：
//! - `ResourceExhausted`: 硬件绑定 / 缓冲区分配失败，流保持 standby，调用方可重试
//! - `Underrun`: 内核缓冲区被耗尽，立即上报，调用方应尽快重写
//! - `Unavailable`: 占用量 / 时间戳查询失败，调节路径 fail-open
//! - `Unsupported`: 固定配置之外的协商请求，固定返回不支持

use thiserror::Error;

/// 音频 HAL 错误
#[derive(Debug, Error)]
pub enum HalError {
    /// 硬件绑定或缓冲区分配失败
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// 内核 PCM 缓冲区 underrun（对应 tinyalsa 的 -EPIPE）
    #[error("pcm underrun")]
    Underrun,

    /// 占用量 / 时间戳暂时不可用
    #[error("unavailable: {0}")]
    Unavailable(&'static str),

    /// 固定配置之外的操作
    #[error("not supported: {0}")]
    Unsupported(&'static str),

    /// 参数格式错误
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, HalError>;
