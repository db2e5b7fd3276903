//! 输出流核心
//!
//! 一条输出流 = 生命周期状态机（Dormant / Active）+ 写路径。
//! 写路径按固定顺序经过：惰性激活 → 缓冲模式判定 → 声道缩减 →
//! 采样率转换 → 写阈值限流 → 提交内核。呈现位置和延迟独立查询。
//!
//! NOTE: 需要同时持有两把锁时，永远先取设备锁、再取流锁。
//! 参数变更路径会在持有设备锁的情况下等待流锁，写路径若反序取锁
//! 必然死锁。限流可能长时间睡眠，因此写路径在进入限流前必须
//! 释放设备锁，只带着流锁睡。

pub mod threshold;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{OutProfile, SampleFormat, SourceConfig};
use crate::device::{AudioDevice, DeviceState, StreamId};
use crate::error::{HalError, Result};
use crate::params::{Params, PARAM_ROUTING};
use crate::pcm::{Direction, PcmDevice};
use crate::resample::{self, ConverterQuality, RateConverter};
use crate::route::out_device;

use self::threshold::{BufferMode, ThresholdController};

/// 呈现位置：累计写入帧数扣掉仍滞留在内核缓冲区里的部分
#[derive(Clone, Copy, Debug)]
pub struct PresentationPosition {
    pub frames: u64,
    pub timestamp: Instant,
}

/// 上行流能力接口
///
/// 上层通过它驱动流：写入、待机、参数、延迟和呈现位置。
/// 固定配置之外的操作一律报 Unsupported，从不致命。
pub trait OutputStream: Send + Sync {
    /// 应用侧采样率
    fn sample_rate(&self) -> u32;
    /// 应用侧声道数
    fn channels(&self) -> u32;
    /// 应用侧样本格式
    fn format(&self) -> SampleFormat;
    /// 建议的单次写入字节数（一个 period）
    fn buffer_size_bytes(&self) -> usize;

    /// 写入交错 PCM 字节流
    ///
    /// 成功时返回完整的请求字节数。激活失败报 ResourceExhausted
    /// （流保持 Dormant），内核缓冲区耗尽报 Underrun 且不附加任何
    /// 延迟，调用方应尽快重写。
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// 释放硬件绑定，回到 Dormant
    fn standby(&self) -> Result<()>;

    /// 流级参数（routing 键触发 standby → 重绑定 → 重算通路）
    fn set_parameters(&self, kvpairs: &str) -> Result<()>;
    fn get_parameters(&self, keys: &str) -> String;

    /// 名义延迟（短缓冲窗口），不反映实时占用量
    fn latency_ms(&self) -> u32;

    /// 呈现位置；Dormant 或查询失败时报 Unavailable
    fn presentation_position(&self) -> Result<PresentationPosition>;

    /// 渲染位置：不支持
    fn render_position(&self) -> Result<u32>;
    /// 下次写入时间戳：不支持
    fn next_write_timestamp(&self) -> Result<i64>;
    /// 流级音量：不支持
    fn set_volume(&self, left: f32, right: f32) -> Result<()>;
}

/// 转换缓冲：一个 period 经转换后的帧，常驻物理内存
struct Scratch {
    buf: Vec<i32>,
    frames: usize,
    locked: bool,
}

impl Scratch {
    fn new(frames: usize, channels: usize) -> Self {
        Self {
            buf: vec![0; frames * channels],
            frames,
            locked: false,
        }
    }

    /// 锁定缓冲内存，避免限流睡眠间隙发生 page fault
    fn lock_memory(&mut self) {
        if self.locked || self.buf.is_empty() {
            return;
        }
        let ptr = self.buf.as_ptr() as *const libc::c_void;
        let len = self.buf.len() * std::mem::size_of::<i32>();
        let result = unsafe { libc::mlock(ptr, len) };
        if result == 0 {
            self.locked = true;
            log::debug!("scratch buffer locked: {} bytes", len);
        } else {
            log::warn!(
                "failed to lock scratch buffer: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    fn unlock_memory(&mut self) {
        if !self.locked {
            return;
        }
        let ptr = self.buf.as_ptr() as *const libc::c_void;
        let len = self.buf.len() * std::mem::size_of::<i32>();
        unsafe {
            libc::munlock(ptr, len);
        }
        self.locked = false;
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

/// 流锁保护的内部状态
struct OutState {
    /// Dormant 标志；true 时不持有任何硬件绑定
    standby: bool,
    /// 硬件绑定，独占；Drop 即关闭
    pcm: Option<Box<dyn PcmDevice>>,
    /// 激活时按路由选定的硬件配置
    profile: OutProfile,
    /// 累计写入帧数，跨 standby / 重激活保留
    written: u64,
    /// 采样率转换器，仅在应用与硬件采样率不一致时存在
    converter: Option<Box<dyn RateConverter>>,
    /// 转换缓冲，生命周期与 converter 绑定
    scratch: Option<Scratch>,
    /// 写阈值控制器
    controller: ThresholdController,
    /// 解码 / 声道缩减工作区，跨调用复用容量
    in_buf: Vec<i32>,
}

/// 一条输出流
pub struct StreamOut {
    dev: Arc<AudioDevice>,
    id: StreamId,
    source: SourceConfig,
    state: Mutex<OutState>,
}

impl StreamOut {
    pub(crate) fn new(
        dev: Arc<AudioDevice>,
        id: StreamId,
        source: SourceConfig,
        initial_profile: OutProfile,
    ) -> Self {
        let controller = ThresholdController::new(&initial_profile);
        Self {
            dev,
            id,
            source,
            state: Mutex::new(OutState {
                standby: true,
                pcm: None,
                profile: initial_profile,
                written: 0,
                converter: None,
                scratch: None,
                controller,
                in_buf: Vec::new(),
            }),
        }
    }

    /// 流 id（设备用它校验单活跃输出）
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Dormant → Active（须同时持有设备锁和流锁）
    ///
    /// 任一步骤失败都不留下部分状态：绑定、转换器、缓冲要么全建好，
    /// 要么全不建，流保持 Dormant。
    fn start_locked(&self, dev: &mut DeviceState, st: &mut OutState) -> Result<()> {
        if let Some(other) = dev.active_out {
            if other != self.id {
                return Err(HalError::ResourceExhausted(format!(
                    "output stream {} is still bound to hardware",
                    other
                )));
            }
        }

        let (card, device, profile) = self.dev.output_profile(dev.out_device);
        let pcm = self
            .dev
            .backend()
            .open(card, device, Direction::Out, &profile)
            .map_err(|e| match e {
                e @ HalError::ResourceExhausted(_) => e,
                other => HalError::ResourceExhausted(other.to_string()),
            })?;

        // 采样率不一致才建转换器；缓冲容纳一个 period 转换后的帧数
        let mut converter = None;
        let mut scratch = None;
        if self.source.sample_rate != profile.rate {
            let conv = resample::create_converter(
                self.source.sample_rate,
                profile.rate,
                profile.channels,
                ConverterQuality::Default,
            )
            .map_err(|e| HalError::ResourceExhausted(e.to_string()))?;

            let frames = profile.period_frames * profile.rate as usize
                / self.source.sample_rate as usize
                + 1;
            let mut scr = Scratch::new(frames, profile.channels as usize);
            scr.lock_memory();

            log::info!(
                "stream {}: rate conversion {} -> {} Hz, scratch {} frames",
                self.id,
                self.source.sample_rate,
                profile.rate,
                frames
            );
            converter = Some(conv);
            scratch = Some(scr);
        }

        st.controller = ThresholdController::new(&profile);
        st.profile = profile;
        st.pcm = Some(pcm);
        st.converter = converter;
        st.scratch = scratch;
        dev.active_out = Some(self.id);

        log::info!("stream {} active on pcm {}:{}", self.id, card, device);
        Ok(())
    }

    /// Active → Dormant（须同时持有设备锁和流锁）
    fn standby_locked(&self, dev: &mut DeviceState, st: &mut OutState) {
        if st.standby {
            return;
        }
        st.pcm = None;
        if dev.active_out == Some(self.id) {
            dev.active_out = None;
        }
        st.converter = None;
        st.scratch = None;
        st.controller.reset();
        st.standby = true;
        log::info!("stream {} entering standby", self.id);
    }

    /// 限流：睡到占用量降到当前阈值以下，然后把阈值向目标收敛一步
    ///
    /// 占用量查询失败时 fail-open：本次既不限流也不调整阈值。
    /// 累计睡眠受最长缓冲窗口约束，绝不无限阻塞。
    fn pace_locked(&self, st: &mut OutState) {
        let max_sleep = st.profile.max_write_sleep();
        let mut total_sleep = Duration::ZERO;
        let mut last_occupancy = None;

        loop {
            let capacity;
            let avail = {
                let OutState { pcm, .. } = &mut *st;
                let pcm = match pcm.as_mut() {
                    Some(p) => p,
                    None => break,
                };
                capacity = pcm.buffer_capacity_frames();
                match pcm.avail_with_timestamp() {
                    Ok((avail, _ts)) => avail,
                    Err(_) => {
                        log::debug!("stream {}: occupancy query failed, pacing skipped", self.id);
                        break;
                    }
                }
            };
            let occupancy = capacity.saturating_sub(avail);
            last_occupancy = Some(occupancy);

            let sleep = match st.controller.sleep_for_occupancy(occupancy) {
                Some(s) => s,
                None => break,
            };
            if total_sleep + sleep > max_sleep {
                log::warn!(
                    "stream {}: pacing sleep bound reached ({}ms accumulated, occupancy {})",
                    self.id,
                    total_sleep.as_millis(),
                    occupancy
                );
                break;
            }
            total_sleep += sleep;
            thread::sleep(sleep);
        }

        if let Some(occupancy) = last_occupancy {
            st.controller.adapt(occupancy);
        }
    }
}

impl OutputStream for StreamOut {
    fn sample_rate(&self) -> u32 {
        self.source.sample_rate
    }

    fn channels(&self) -> u32 {
        self.source.channels
    }

    fn format(&self) -> SampleFormat {
        self.source.format
    }

    fn buffer_size_bytes(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.profile.period_frames * self.source.frame_bytes()
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        let frame_bytes = self.source.frame_bytes();
        let in_frames = data.len() / frame_bytes;
        if in_frames == 0 {
            return Ok(data.len());
        }

        // 先设备锁后流锁；限流开始前放掉设备锁（见模块注释）
        let mut dev = self.dev.lock_state();
        let mut st = self.state.lock().unwrap();
        if st.standby {
            self.start_locked(&mut dev, &mut st)?;
            st.standby = false;
        }
        let sco_on = dev.out_device & out_device::ALL_SCO != 0;
        let screen_off = dev.screen_off;
        drop(dev);

        // SCO 链路没有占用量反馈：模式判定、限流、阈值收敛全部跳过
        if !sco_on {
            let want = if screen_off {
                BufferMode::Long
            } else {
                BufferMode::Short
            };
            st.controller.select_mode(want);
        }

        // 字节解码为 i32 样本
        let format = self.source.format;
        {
            let OutState { in_buf, .. } = &mut *st;
            format.decode_into(data, in_buf);
        }

        // 声道缩减：应用声道多于硬件时丢弃多余声道，
        // 保留每帧第一个声道的样本，帧大小随之减半
        let src_channels = self.source.channels as usize;
        let hw_channels = st.profile.channels as usize;
        if src_channels > hw_channels {
            let OutState { in_buf, .. } = &mut *st;
            for i in 1..in_frames {
                in_buf[i] = in_buf[i * src_channels];
            }
            in_buf.truncate(in_frames);
        }

        // 采样率转换：产出可能少于请求，提交的是实际产出帧数
        let use_scratch = st.converter.is_some();
        let frames_to_write = {
            let OutState {
                converter,
                scratch,
                in_buf,
                ..
            } = &mut *st;
            match (converter.as_mut(), scratch.as_mut()) {
                (Some(conv), Some(scr)) => {
                    let (_consumed, produced) = conv.convert(in_buf, &mut scr.buf);
                    produced
                }
                _ => in_buf.len() / hw_channels,
            }
        };

        if !sco_on {
            self.pace_locked(&mut st);
        }

        // 提交；underrun 立即上抛，调用方应尽快重写而不是等待
        let frames = {
            let OutState {
                pcm,
                scratch,
                in_buf,
                ..
            } = &mut *st;
            let pcm = pcm
                .as_mut()
                .ok_or(HalError::Unavailable("pcm binding missing"))?;
            let submit: &[i32] = if use_scratch {
                let scr = scratch
                    .as_ref()
                    .ok_or(HalError::Unavailable("scratch buffer missing"))?;
                &scr.buf[..frames_to_write * hw_channels]
            } else {
                &in_buf[..frames_to_write * hw_channels]
            };
            if submit.is_empty() {
                0
            } else {
                pcm.write(submit)?
            }
        };
        st.written += frames as u64;

        Ok(data.len())
    }

    fn standby(&self) -> Result<()> {
        let mut dev = self.dev.lock_state();
        let mut st = self.state.lock().unwrap();
        self.standby_locked(&mut dev, &mut st);
        Ok(())
    }

    fn set_parameters(&self, kvpairs: &str) -> Result<()> {
        let params = Params::parse(kvpairs);
        if let Some(value) = params.get_int(PARAM_ROUTING) {
            let routing = u32::try_from(value).map_err(|_| {
                HalError::InvalidArgument(format!("bad routing value: {}", value))
            })?;

            let mut dev = self.dev.lock_state();
            if dev.out_device != routing && routing != 0 {
                // 路由变更要求 standby：SCO 与主输出用不同的 PCM
                {
                    let mut st = self.state.lock().unwrap();
                    self.standby_locked(&mut dev, &mut st);
                }
                dev.out_device = routing;
                self.dev.select_devices_locked(&mut dev);
            }
        }
        Ok(())
    }

    fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }

    fn latency_ms(&self) -> u32 {
        let st = self.state.lock().unwrap();
        st.profile.short_latency_ms()
    }

    fn presentation_position(&self) -> Result<PresentationPosition> {
        let mut st = self.state.lock().unwrap();
        let written = st.written;
        let OutState { pcm, .. } = &mut *st;
        let pcm = pcm
            .as_mut()
            .ok_or(HalError::Unavailable("stream is in standby"))?;

        let capacity = pcm.buffer_capacity_frames();
        let (avail, timestamp) = pcm
            .avail_with_timestamp()
            .map_err(|_| HalError::Unavailable("timestamp query failed"))?;

        let signed = written as i64 - capacity as i64 + avail as i64;
        if signed < 0 {
            return Err(HalError::Unavailable("position not yet meaningful"));
        }
        Ok(PresentationPosition {
            frames: signed as u64,
            timestamp,
        })
    }

    fn render_position(&self) -> Result<u32> {
        Err(HalError::Unsupported("render position"))
    }

    fn next_write_timestamp(&self) -> Result<i64> {
        Err(HalError::Unsupported("next write timestamp"))
    }

    fn set_volume(&self, _left: f32, _right: f32) -> Result<()> {
        Err(HalError::Unsupported("per-stream volume"))
    }
}

impl Drop for StreamOut {
    fn drop(&mut self) {
        // 兜底释放；正常路径应当先显式 standby
        let _ = self.standby();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::RouteControl;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// 脚本化 PCM 后端：可注入打开失败、占用量序列、underrun
    #[derive(Default)]
    struct FakeShared {
        open_calls: usize,
        fail_open: bool,
        /// 依次弹出的可写空间；None 表示查询失败
        avail_script: VecDeque<Option<usize>>,
        /// 脚本耗尽后的默认可写空间；None 表示整个缓冲区可写
        default_avail: Option<usize>,
        underrun_next: bool,
        written: Vec<i32>,
        write_frames: Vec<usize>,
        last_profile: Option<OutProfile>,
    }

    struct FakeBackend {
        shared: Arc<Mutex<FakeShared>>,
    }

    impl crate::pcm::PcmBackend for FakeBackend {
        fn open(
            &self,
            _card: u32,
            _device: u32,
            _direction: Direction,
            profile: &OutProfile,
        ) -> Result<Box<dyn PcmDevice>> {
            let mut sh = self.shared.lock().unwrap();
            sh.open_calls += 1;
            if sh.fail_open {
                return Err(HalError::ResourceExhausted("scripted open failure".into()));
            }
            sh.last_profile = Some(profile.clone());
            Ok(Box::new(FakePcm {
                shared: Arc::clone(&self.shared),
                capacity: profile.buffer_capacity_frames(),
                channels: profile.channels as usize,
            }))
        }
    }

    struct FakePcm {
        shared: Arc<Mutex<FakeShared>>,
        capacity: usize,
        channels: usize,
    }

    impl PcmDevice for FakePcm {
        fn write(&mut self, samples: &[i32]) -> Result<usize> {
            let mut sh = self.shared.lock().unwrap();
            if sh.underrun_next {
                sh.underrun_next = false;
                return Err(HalError::Underrun);
            }
            sh.written.extend_from_slice(samples);
            let frames = samples.len() / self.channels;
            sh.write_frames.push(frames);
            Ok(frames)
        }

        fn avail_with_timestamp(&mut self) -> Result<(usize, Instant)> {
            let mut sh = self.shared.lock().unwrap();
            let next = sh.avail_script.pop_front();
            match next {
                Some(Some(avail)) => Ok((avail, Instant::now())),
                Some(None) => Err(HalError::Unavailable("scripted query failure")),
                None => Ok((sh.default_avail.unwrap_or(self.capacity), Instant::now())),
            }
        }

        fn buffer_capacity_frames(&self) -> usize {
            self.capacity
        }
    }

    /// 把应用过的通路记录到共享 Vec，供断言
    struct SharedRoute(Arc<Mutex<Vec<String>>>);

    impl RouteControl for SharedRoute {
        fn reset(&mut self) {
            self.0.lock().unwrap().clear();
        }
        fn apply_path(&mut self, path: &str) {
            self.0.lock().unwrap().push(path.to_string());
        }
        fn update(&mut self) {}
    }

    fn make_device(shared: &Arc<Mutex<FakeShared>>) -> Arc<AudioDevice> {
        AudioDevice::new(
            Box::new(FakeBackend {
                shared: Arc::clone(shared),
            }),
            Box::new(crate::route::LoggingRoute::new()),
        )
    }

    fn stereo_bytes(frames: usize, sample: impl Fn(usize) -> (i32, i32)) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(frames * 8);
        for i in 0..frames {
            let (l, r) = sample(i);
            bytes.extend_from_slice(&l.to_le_bytes());
            bytes.extend_from_slice(&r.to_le_bytes());
        }
        bytes
    }

    fn silence(frames: usize) -> Vec<u8> {
        stereo_bytes(frames, |_| (0, 0))
    }

    #[test]
    fn test_first_write_activates_lazily() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();

        assert_eq!(shared.lock().unwrap().open_calls, 0);
        assert!(dev.active_output().is_none());

        let data = silence(256);
        assert_eq!(stream.write(&data).unwrap(), data.len());

        let sh = shared.lock().unwrap();
        assert_eq!(sh.open_calls, 1);
        drop(sh);
        assert_eq!(dev.active_output(), Some(stream.id()));

        // 同采样率：不建转换器，也没有转换缓冲
        let st = stream.state.lock().unwrap();
        assert!(!st.standby);
        assert!(st.converter.is_none());
        assert!(st.scratch.is_none());
        assert_eq!(st.written, 256);
    }

    #[test]
    fn test_activation_failure_leaves_stream_dormant() {
        let shared = Arc::new(Mutex::new(FakeShared {
            fail_open: true,
            ..Default::default()
        }));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();

        let data = silence(128);
        let err = stream.write(&data).expect_err("open failure must fail the write");
        assert!(matches!(err, HalError::ResourceExhausted(_)));

        {
            let st = stream.state.lock().unwrap();
            assert!(st.standby);
            assert!(st.pcm.is_none());
        }
        assert!(dev.active_output().is_none());

        // 调用方可重试
        shared.lock().unwrap().fail_open = false;
        assert!(stream.write(&data).is_ok());
    }

    #[test]
    fn test_rate_mismatch_creates_converter_and_scratch() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(44100, 2))
            .unwrap();

        stream.write(&silence(128)).unwrap();

        let st = stream.state.lock().unwrap();
        assert!(st.converter.is_some());
        // 128 * 48000 / 44100 + 1 = 140
        let scr = st.scratch.as_ref().expect("scratch must exist");
        assert_eq!(scr.frames, 140);
    }

    #[test]
    fn test_channel_reduction_keeps_first_channel() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let mono = OutProfile {
            channels: 1,
            ..OutProfile::primary()
        };
        let dev = AudioDevice::with_profiles(
            Box::new(FakeBackend {
                shared: Arc::clone(&shared),
            }),
            Box::new(crate::route::LoggingRoute::new()),
            mono,
            OutProfile::sco(),
        );
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();

        // 左声道 10,20,30,40；右声道是要被丢掉的负值
        let data = stereo_bytes(4, |i| ((i as i32 + 1) * 10, -((i as i32 + 1) * 10)));
        stream.write(&data).unwrap();

        let sh = shared.lock().unwrap();
        assert_eq!(sh.written, vec![10, 20, 30, 40]);
        assert_eq!(sh.write_frames, vec![4]);
    }

    #[test]
    fn test_underrun_propagates_without_delay() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();
        stream.write(&silence(256)).unwrap();

        shared.lock().unwrap().underrun_next = true;
        let t0 = Instant::now();
        let err = stream.write(&silence(256)).expect_err("underrun must propagate");
        assert!(matches!(err, HalError::Underrun));
        // 不附加补偿性睡眠
        assert!(t0.elapsed() < Duration::from_millis(50));

        // 失败的提交不计入累计帧数
        assert_eq!(stream.state.lock().unwrap().written, 256);
    }

    #[test]
    fn test_standby_roundtrip_preserves_written_counter() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();

        stream.write(&silence(256)).unwrap();
        stream.standby().unwrap();

        {
            let st = stream.state.lock().unwrap();
            assert!(st.standby);
            assert!(st.pcm.is_none());
            assert!(st.converter.is_none());
            assert!(st.scratch.is_none());
            assert_eq!(st.controller.mode(), BufferMode::Unknown);
            assert_eq!(st.written, 256);
        }
        assert!(dev.active_output().is_none());

        // 重激活：计数继续累加，绑定重开一次
        stream.write(&silence(256)).unwrap();
        assert_eq!(stream.state.lock().unwrap().written, 512);
        assert_eq!(shared.lock().unwrap().open_calls, 2);
    }

    #[test]
    fn test_single_active_output_per_device() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let s1 = dev.open_output_stream(SourceConfig::new(48000, 2)).unwrap();
        let s2 = dev.open_output_stream(SourceConfig::new(48000, 2)).unwrap();

        s1.write(&silence(128)).unwrap();
        assert_eq!(dev.active_output(), Some(s1.id()));

        // 第二条流在第一条仍绑定时不能激活
        let err = s2.write(&silence(128)).expect_err("second bind must fail");
        assert!(matches!(err, HalError::ResourceExhausted(_)));
        assert_eq!(dev.active_output(), Some(s1.id()));

        s1.standby().unwrap();
        s2.write(&silence(128)).unwrap();
        assert_eq!(dev.active_output(), Some(s2.id()));
    }

    #[test]
    fn test_presentation_position() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();

        // Dormant：不可用
        assert!(matches!(
            stream.presentation_position(),
            Err(HalError::Unavailable(_))
        ));

        stream.write(&silence(256)).unwrap();

        // 内核还压着 100 帧：位置 = 256 - 100
        shared.lock().unwrap().avail_script.push_back(Some(1024 - 100));
        let pos = stream.presentation_position().unwrap();
        assert_eq!(pos.frames, 156);

        // 查询失败：不可用
        shared.lock().unwrap().avail_script.push_back(None);
        assert!(matches!(
            stream.presentation_position(),
            Err(HalError::Unavailable(_))
        ));
    }

    #[test]
    fn test_presentation_position_negative_is_unavailable() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();

        stream.write(&silence(64)).unwrap();

        // 写入 64 帧却声称压着 100 帧：结果为负，按不可用处理
        shared.lock().unwrap().avail_script.push_back(Some(1024 - 100));
        assert!(matches!(
            stream.presentation_position(),
            Err(HalError::Unavailable(_))
        ));
    }

    #[test]
    fn test_pacing_sleeps_when_occupancy_exceeds_threshold() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();

        // 激活写：阈值快照到短缓冲 256 帧
        stream.write(&silence(128)).unwrap();

        // 占用量 384 帧，超出一个 period → 睡 2666µs 后复查，已降到 0
        {
            let mut sh = shared.lock().unwrap();
            sh.avail_script.push_back(Some(1024 - 384));
        }
        let t0 = Instant::now();
        stream.write(&silence(128)).unwrap();
        assert!(
            t0.elapsed() >= Duration::from_micros(2000),
            "pacing should have slept, elapsed {:?}",
            t0.elapsed()
        );
    }

    #[test]
    fn test_pacing_skips_sub_granularity_sleep() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();
        stream.write(&silence(128)).unwrap();

        // 超出 40 帧 ≈ 833µs，低于最小粒度：查询一次就放行，不睡
        {
            let mut sh = shared.lock().unwrap();
            sh.avail_script.push_back(Some(1024 - 296));
        }
        let t0 = Instant::now();
        stream.write(&silence(128)).unwrap();
        assert!(t0.elapsed() < Duration::from_millis(100));
        assert!(shared.lock().unwrap().avail_script.is_empty());
    }

    #[test]
    fn test_pacing_gives_up_at_max_sleep_bound() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();
        stream.write(&silence(128)).unwrap();

        // 占用量恒为整个缓冲区：第一轮睡 16ms，第二轮会超出
        // 21.3ms 的上限，于是放弃等待并提交
        shared.lock().unwrap().default_avail = Some(0);
        let t0 = Instant::now();
        stream.write(&silence(128)).unwrap();
        let elapsed = t0.elapsed();
        assert!(elapsed >= Duration::from_millis(10), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(200), "elapsed {:?}", elapsed);
    }

    #[test]
    fn test_query_failure_fails_open() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();
        stream.write(&silence(128)).unwrap();

        // 查询失败：跳过限流直接提交，不报错
        shared.lock().unwrap().avail_script.push_back(None);
        let t0 = Instant::now();
        stream.write(&silence(128)).unwrap();
        assert!(t0.elapsed() < Duration::from_millis(100));
        assert_eq!(stream.state.lock().unwrap().written, 256);
    }

    #[test]
    fn test_screen_state_drives_buffer_mode() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();

        dev.set_parameters("screen_state=off").unwrap();
        stream.write(&silence(128)).unwrap();
        {
            let st = stream.state.lock().unwrap();
            assert_eq!(st.controller.mode(), BufferMode::Long);
            // 激活后第一次判定：阈值直接就位
            assert_eq!(st.controller.current_threshold(), 1024);
        }

        // 转回短缓冲：目标下降，当前阈值按 1/4 period 收敛
        dev.set_parameters("screen_state=on").unwrap();
        stream.write(&silence(128)).unwrap();
        {
            let st = stream.state.lock().unwrap();
            assert_eq!(st.controller.mode(), BufferMode::Short);
            assert_eq!(st.controller.target_threshold(), 256);
            assert_eq!(st.controller.current_threshold(), 1024 - 32);
        }
    }

    #[test]
    fn test_sco_route_skips_pacing_entirely() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();

        stream
            .set_parameters(&format!("routing={}", out_device::BLUETOOTH_SCO))
            .unwrap();

        // 塞一个会失败的查询：SCO 路径根本不该碰它
        shared.lock().unwrap().avail_script.push_back(None);
        stream.write(&silence(256)).unwrap();

        let sh = shared.lock().unwrap();
        assert_eq!(sh.avail_script.len(), 1, "sco write must not query occupancy");
        // SCO profile：8kHz 单声道
        let profile = sh.last_profile.as_ref().expect("profile captured at open");
        assert_eq!(profile.rate, 8000);
        assert_eq!(profile.channels, 1);
        drop(sh);

        // 模式保持 Unknown：SCO 不做缓冲模式判定
        let st = stream.state.lock().unwrap();
        assert_eq!(st.controller.mode(), BufferMode::Unknown);
        // 声道缩减 + 48k → 8k 转换都在路上
        assert!(st.converter.is_some());
    }

    #[test]
    fn test_routing_change_standbys_and_reroutes() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let paths = Arc::new(Mutex::new(Vec::new()));
        let dev = AudioDevice::new(
            Box::new(FakeBackend {
                shared: Arc::clone(&shared),
            }),
            Box::new(SharedRoute(Arc::clone(&paths))),
        );
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();

        stream.write(&silence(128)).unwrap();
        assert!(dev.active_output().is_some());

        stream
            .set_parameters(&format!("routing={}", out_device::WIRED_HEADPHONE))
            .unwrap();

        // 路由变更：流已回到 standby，通路换成耳机 + 主麦克风
        assert!(dev.active_output().is_none());
        assert!(stream.state.lock().unwrap().standby);
        assert_eq!(
            *paths.lock().unwrap(),
            vec!["headphone".to_string(), "main-mic-top".to_string()]
        );

        // 相同路由或 0 值不触发任何动作
        stream.write(&silence(128)).unwrap();
        stream
            .set_parameters(&format!("routing={}", out_device::WIRED_HEADPHONE))
            .unwrap();
        assert!(dev.active_output().is_some());
        stream.set_parameters("routing=0").unwrap();
        assert!(dev.active_output().is_some());
    }

    #[test]
    fn test_empty_write_is_a_noop() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();

        assert_eq!(stream.write(&[]).unwrap(), 0);
        // 不足一帧的字节同样不触发激活
        assert_eq!(stream.write(&[0u8; 7]).unwrap(), 7);
        assert_eq!(shared.lock().unwrap().open_calls, 0);
    }

    #[test]
    fn test_unsupported_surface() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(48000, 2))
            .unwrap();

        assert!(matches!(
            stream.render_position(),
            Err(HalError::Unsupported(_))
        ));
        assert!(matches!(
            stream.next_write_timestamp(),
            Err(HalError::Unsupported(_))
        ));
        assert!(matches!(
            stream.set_volume(1.0, 1.0),
            Err(HalError::Unsupported(_))
        ));
        assert_eq!(stream.get_parameters("routing"), "");
    }

    #[test]
    fn test_stream_surface_reports_source_format() {
        let shared = Arc::new(Mutex::new(FakeShared::default()));
        let dev = make_device(&shared);
        let stream = dev
            .open_output_stream(SourceConfig::new(44100, 2))
            .unwrap();

        assert_eq!(stream.sample_rate(), 44100);
        assert_eq!(stream.channels(), 2);
        assert_eq!(stream.format(), SampleFormat::S32Le);
        // 一个 period 的应用侧字节数：128 帧 * 8 字节
        assert_eq!(stream.buffer_size_bytes(), 1024);
        assert_eq!(stream.latency_ms(), 5);
    }
}
