//! 字符串键值参数协议
//!
//! 上层以 `key=value;key=value` 形式下发控制参数。
//! 这里只做解析和取值，各键的语义由设备 / 流自行处理。

/// 路由设备位掩码（整数）
pub const PARAM_ROUTING: &str = "routing";
/// 屏幕方向：landscape / portrait / square
pub const PARAM_ORIENTATION: &str = "orientation";
/// 屏幕状态：on / off
pub const PARAM_SCREEN_STATE: &str = "screen_state";

/// 开关值
pub const VALUE_ON: &str = "on";
pub const VALUE_OFF: &str = "off";

/// 已解析的参数集合（保持出现顺序，后出现的同名键覆盖前者）
#[derive(Debug, Default)]
pub struct Params {
    pairs: Vec<(String, String)>,
}

impl Params {
    /// 解析 `key=value;key=value` 字符串
    ///
    /// 空段和没有 `=` 的段被忽略
    pub fn parse(kvpairs: &str) -> Self {
        let mut pairs = Vec::new();
        for piece in kvpairs.split(';') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            if let Some((key, value)) = piece.split_once('=') {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                pairs.push((key.to_string(), value.trim().to_string()));
            }
        }
        Self { pairs }
    }

    /// 取字符串值（同名键取最后一个）
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// 取整数值，解析失败视为不存在
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
