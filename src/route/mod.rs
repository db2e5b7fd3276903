//! 路由与混音器通路
//!
//! 输出 / 输入设备用位掩码表示，混音器通路由外部协作者
//! （[`RouteControl`]）按命名 path 应用。通路只在路由或屏幕方向
//! 变化时重算，不在每次写调用上触碰。

/// 输出设备位掩码
pub mod out_device {
    pub const EARPIECE: u32 = 0x1;
    pub const SPEAKER: u32 = 0x2;
    pub const WIRED_HEADSET: u32 = 0x4;
    pub const WIRED_HEADPHONE: u32 = 0x8;
    pub const BLUETOOTH_SCO: u32 = 0x10;
    pub const BLUETOOTH_SCO_HEADSET: u32 = 0x20;
    pub const BLUETOOTH_SCO_CARKIT: u32 = 0x40;
    pub const ANLG_DOCK_HEADSET: u32 = 0x800;

    /// 所有 SCO 语音设备
    pub const ALL_SCO: u32 = BLUETOOTH_SCO | BLUETOOTH_SCO_HEADSET | BLUETOOTH_SCO_CARKIT;
}

/// 输入设备位掩码
pub mod in_device {
    pub const BUILTIN_MIC: u32 = 0x4;
}

/// 屏幕方向
///
/// 只影响主麦克风通路的选择，与输出写路径无关
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Landscape,
    Portrait,
    Square,
    Undefined,
}

impl Orientation {
    /// 从参数字符串解析，未知取值归为 Undefined
    pub fn from_param(value: &str) -> Self {
        match value {
            "landscape" => Self::Landscape,
            "portrait" => Self::Portrait,
            "square" => Self::Square,
            _ => Self::Undefined,
        }
    }
}

/// 混音器通路协作者
///
/// 对应底层 mixer 控制：先 reset 清空，逐条 apply 命名通路，
/// 最后 update 一次性下发
pub trait RouteControl: Send {
    fn reset(&mut self);
    fn apply_path(&mut self, path: &str);
    fn update(&mut self);
}

/// 记录型实现：把应用过的通路留在内存里并打日志
///
/// 没有真实 mixer 的环境（仿真后端、测试、演示程序）用它即可
#[derive(Default)]
pub struct LoggingRoute {
    active: Vec<String>,
}

impl LoggingRoute {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前生效的通路（按应用顺序）
    pub fn active_paths(&self) -> &[String] {
        &self.active
    }
}

impl RouteControl for LoggingRoute {
    fn reset(&mut self) {
        self.active.clear();
    }

    fn apply_path(&mut self, path: &str) {
        self.active.push(path.to_string());
    }

    fn update(&mut self) {
        log::debug!("mixer paths: [{}]", self.active.join(", "));
    }
}
