//! 设备控制面
//!
//! 进程级共享状态：路由位掩码、屏幕方向 / 屏幕状态、麦克风静音，
//! 以及"同一时刻至多一条输出流绑定硬件"的不变量。
//! 活跃输出用流 id 记录而不是持有引用，由绑定 / 解绑路径校验，
//! 不产生所有权纠缠。
//!
//! NOTE: 锁顺序同 stream 模块：先设备锁后流锁。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{OutProfile, SampleFormat, SourceConfig};
use crate::error::{HalError, Result};
use crate::params::{Params, PARAM_ORIENTATION, PARAM_SCREEN_STATE, VALUE_ON};
use crate::pcm::PcmBackend;
use crate::route::{in_device, out_device, Orientation, RouteControl};
use crate::stream::{OutputStream, StreamOut};

/// 输出流标识，设备用它校验单活跃输出不变量
pub type StreamId = u64;

/// 主输出 PCM 的卡号 / 设备号
const PCM_CARD: u32 = 0;
const PCM_DEVICE: u32 = 0;
/// SCO 语音走另一路 PCM
const PCM_DEVICE_SCO: u32 = 1;

/// 设备锁保护的共享状态
pub(crate) struct DeviceState {
    pub(crate) out_device: u32,
    pub(crate) in_device: u32,
    pub(crate) orientation: Orientation,
    pub(crate) screen_off: bool,
    pub(crate) mic_mute: bool,
    /// 当前绑定硬件的输出流；None 表示没有流处于 Active
    pub(crate) active_out: Option<StreamId>,
    pub(crate) route: Box<dyn RouteControl>,
}

/// 音频设备
pub struct AudioDevice {
    backend: Box<dyn PcmBackend>,
    primary_profile: OutProfile,
    sco_profile: OutProfile,
    state: Mutex<DeviceState>,
    next_stream_id: AtomicU64,
}

impl AudioDevice {
    /// 用默认硬件配置创建设备
    pub fn new(backend: Box<dyn PcmBackend>, route: Box<dyn RouteControl>) -> Arc<Self> {
        Self::with_profiles(backend, route, OutProfile::primary(), OutProfile::sco())
    }

    /// 指定硬件配置创建设备
    ///
    /// 配置此后只读，激活路径按引用取用
    pub fn with_profiles(
        backend: Box<dyn PcmBackend>,
        route: Box<dyn RouteControl>,
        primary_profile: OutProfile,
        sco_profile: OutProfile,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            primary_profile,
            sco_profile,
            state: Mutex::new(DeviceState {
                out_device: out_device::SPEAKER,
                in_device: in_device::BUILTIN_MIC,
                orientation: Orientation::Undefined,
                screen_off: false,
                mic_mute: false,
                active_out: None,
                route,
            }),
            next_stream_id: AtomicU64::new(1),
        })
    }

    /// 打开一条输出流（创建即 Dormant，首次写入才绑定硬件）
    ///
    /// 固定配置之外的格式协商一律拒绝：只接受 32-bit PCM 立体声，
    /// 采样率任意（与硬件不一致时由写路径转换）。
    pub fn open_output_stream(self: &Arc<Self>, source: SourceConfig) -> Result<Arc<StreamOut>> {
        if source.format != SampleFormat::S32Le {
            return Err(HalError::Unsupported("only 32-bit PCM output"));
        }
        if source.channels != 2 {
            return Err(HalError::Unsupported("only stereo source streams"));
        }
        if source.sample_rate == 0 {
            return Err(HalError::InvalidArgument("zero sample rate".to_string()));
        }

        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "open output stream {}: {} Hz, {} channels",
            id,
            source.sample_rate,
            source.channels
        );
        Ok(Arc::new(StreamOut::new(
            Arc::clone(self),
            id,
            source,
            self.primary_profile.clone(),
        )))
    }

    /// 关闭输出流：显式送回 standby
    pub fn close_output_stream(&self, stream: &StreamOut) {
        let _ = stream.standby();
        log::info!("output stream {} closed", stream.id());
    }

    /// 输入采集路径未实现
    pub fn open_input_stream(&self) -> Result<()> {
        Err(HalError::Unsupported("input capture path"))
    }

    /// 输入缓冲建议值：没有输入路径，恒为 0
    pub fn input_buffer_size(&self) -> usize {
        0
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn backend(&self) -> &dyn PcmBackend {
        self.backend.as_ref()
    }

    /// 按路由选择硬件配置：SCO 走窄带 profile 和独立的 PCM 设备号
    pub(crate) fn output_profile(&self, out_dev: u32) -> (u32, u32, OutProfile) {
        if out_dev & out_device::ALL_SCO != 0 {
            (PCM_CARD, PCM_DEVICE_SCO, self.sco_profile.clone())
        } else {
            (PCM_CARD, PCM_DEVICE, self.primary_profile.clone())
        }
    }

    /// 按当前路由重算混音器通路（须持设备锁）
    ///
    /// 只在路由或方向变化时调用，不在写路径上
    pub(crate) fn select_devices_locked(&self, dev: &mut DeviceState) {
        let headphone_on =
            dev.out_device & (out_device::WIRED_HEADSET | out_device::WIRED_HEADPHONE) != 0;
        let speaker_on = dev.out_device & out_device::SPEAKER != 0;
        let docked = dev.out_device & out_device::ANLG_DOCK_HEADSET != 0;
        let main_mic_on = dev.in_device & in_device::BUILTIN_MIC != 0;

        dev.route.reset();
        if speaker_on {
            dev.route.apply_path("speaker");
        }
        if headphone_on {
            dev.route.apply_path("headphone");
        }
        if docked {
            dev.route.apply_path("dock");
        }
        if main_mic_on {
            // 主麦克风通路跟随屏幕方向
            if dev.orientation == Orientation::Landscape {
                dev.route.apply_path("main-mic-left");
            } else {
                dev.route.apply_path("main-mic-top");
            }
        }
        dev.route.update();

        log::debug!(
            "route: hp={} speaker={} dock={} main-mic={}",
            if headphone_on { 'y' } else { 'n' },
            if speaker_on { 'y' } else { 'n' },
            if docked { 'y' } else { 'n' },
            if main_mic_on { 'y' } else { 'n' }
        );
    }

    /// 设备级参数：orientation / screen_state
    pub fn set_parameters(&self, kvpairs: &str) -> Result<()> {
        let params = Params::parse(kvpairs);

        if let Some(value) = params.get(PARAM_ORIENTATION) {
            let orientation = Orientation::from_param(value);
            let mut dev = self.lock_state();
            if orientation != dev.orientation {
                dev.orientation = orientation;
                // 方向变化可能发生在输入设备关闭期间，这里必须
                // 主动重算通路，否则主麦克风通路停留在旧方向
                self.select_devices_locked(&mut dev);
            }
        }

        if let Some(value) = params.get(PARAM_SCREEN_STATE) {
            let mut dev = self.lock_state();
            dev.screen_off = value != VALUE_ON;
        }

        Ok(())
    }

    /// 设备级参数查询：无可上报项
    pub fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }

    pub fn set_mic_mute(&self, mute: bool) {
        self.lock_state().mic_mute = mute;
    }

    pub fn mic_mute(&self) -> bool {
        self.lock_state().mic_mute
    }

    /// 主音量：不支持
    pub fn set_master_volume(&self, _volume: f32) -> Result<()> {
        Err(HalError::Unsupported("master volume"))
    }

    /// 语音通话音量：不支持
    pub fn set_voice_volume(&self, _volume: f32) -> Result<()> {
        Err(HalError::Unsupported("voice volume"))
    }

    pub fn init_check(&self) -> Result<()> {
        Ok(())
    }

    /// 当前绑定硬件的输出流 id（诊断 / 测试用）
    pub fn active_output(&self) -> Option<StreamId> {
        self.lock_state().active_out
    }
}
