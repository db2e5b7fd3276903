//! Primary Audio HAL 演示程序
//!
//! 用仿真 PCM 后端把完整写路径跑起来：正弦波 → 声道 / 采样率适配 →
//! 写阈值限流 → 仿真环形缓冲。限流行为和呈现位置通过日志观察。

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use audio_primary::pcm::SimBackend;
use audio_primary::route::LoggingRoute;
use audio_primary::{AudioDevice, HalError, OutputStream, SourceConfig};

/// Primary audio HAL demo - paced PCM output against a simulated ring buffer
#[derive(Parser)]
#[command(name = "audio-primary")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Source sample rate in Hz (hardware is fixed at 48000)
    #[arg(short, long, default_value = "48000")]
    rate: u32,

    /// Playback duration in seconds
    #[arg(short, long, default_value = "5")]
    seconds: u64,

    /// Tone frequency in Hz
    #[arg(short, long, default_value = "440")]
    frequency: f64,

    /// Start with the screen reported off (long buffering mode)
    #[arg(long)]
    screen_off: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let dev = AudioDevice::new(Box::new(SimBackend::new()), Box::new(LoggingRoute::new()));
    if cli.screen_off {
        dev.set_parameters("screen_state=off")?;
    }

    let stream = dev.open_output_stream(SourceConfig::new(cli.rate, 2))?;
    log::info!(
        "stream: {} Hz stereo, suggested write size {} bytes, nominal latency {} ms",
        stream.sample_rate(),
        stream.buffer_size_bytes(),
        stream.latency_ms()
    );

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })?;
    }

    // 每次写一个 period 的应用侧帧
    let chunk_bytes = stream.buffer_size_bytes();
    let frame_bytes = 8; // 立体声 32-bit
    let chunk_frames = chunk_bytes / frame_bytes;
    let mut buf = vec![0u8; chunk_bytes];
    let phase_step = 2.0 * PI * cli.frequency / cli.rate as f64;
    let mut phase = 0.0f64;

    let deadline = Instant::now() + Duration::from_secs(cli.seconds);
    let mut last_report = Instant::now();

    while !stop.load(Ordering::SeqCst) && Instant::now() < deadline {
        for frame in 0..chunk_frames {
            let sample = (phase.sin() * 0.3 * i32::MAX as f64) as i32;
            phase = (phase + phase_step) % (2.0 * PI);
            let bytes = sample.to_le_bytes();
            buf[frame * 8..frame * 8 + 4].copy_from_slice(&bytes);
            buf[frame * 8 + 4..frame * 8 + 8].copy_from_slice(&bytes);
        }

        match stream.write(&buf) {
            Ok(_) => {}
            Err(HalError::Underrun) => {
                // 立刻重写追赶，不额外等待
                log::warn!("underrun reported, rewriting immediately");
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            match stream.presentation_position() {
                Ok(pos) => log::info!("presented {} frames", pos.frames),
                Err(e) => log::debug!("position unavailable: {}", e),
            }
        }
    }

    stream.standby()?;
    dev.close_output_stream(&stream);
    log::info!("done");
    Ok(())
}
