//! deskmux command-line interface.
//!
//! A headless desktop recorder: screen, system audio, and microphone into
//! a single MP4. The capture core lives in `deskmux-core`; this binary
//! parses arguments, wires up the console status/progress sinks and the
//! Ctrl-C bridge, and maps results to exit codes.

mod exit_codes;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use deskmux_core::{
    spawn_emergency_watchdog, AudioSources, CancelToken, CaptureParams, CaptureStats,
    ConsoleReporter, Region,
};
use exit_codes::ExitCode;

/// deskmux - Windows desktop recorder
#[derive(Parser, Debug)]
#[command(name = "deskmux")]
#[command(version, about, long_about = None)]
#[command(after_help = "\
Notes:
  - Default: video + both audio sources, unlimited time, 30 FPS
  - Enabling only the audio options still produces an MP4 recording
  - Any combination of --video, --system, and --microphone records the selected sources")]
struct Cli {
    /// Output filename (default: yymmddhhmmss.mp4)
    #[arg(short = 'o', long = "out", value_name = "FILE")]
    out: Option<PathBuf>,

    /// Recording duration in seconds; 0 = unlimited
    #[arg(short = 't', long = "time", value_name = "SECONDS", default_value_t = 0)]
    time: u32,

    /// Enable video capture
    #[arg(short = 'v', long)]
    video: bool,

    /// Enable system audio capture
    #[arg(short = 's', long)]
    system: bool,

    /// Enable microphone capture
    #[arg(short = 'm', long)]
    microphone: bool,

    /// Frame rate
    #[arg(long, value_name = "RATE", default_value_t = 30,
          value_parser = clap::value_parser!(u32).range(1..=120))]
    fps: u32,

    /// Monitor index to capture
    #[arg(long, value_name = "INDEX", default_value_t = 0)]
    monitor: u32,

    /// Include cursor in capture
    #[arg(long, value_name = "on|off", default_value = "on",
          value_parser = ["on", "off"])]
    cursor: String,

    /// Capture a specific region instead of the full screen
    #[arg(long, num_args = 4, value_names = ["X", "Y", "W", "H"],
          allow_negative_numbers = true)]
    region: Option<Vec<i64>>,
}

impl Cli {
    fn into_params(self) -> Result<CaptureParams, String> {
        let output_path = self.out.unwrap_or_else(default_output_name);

        let region = match self.region {
            Some(values) => {
                // clap guarantees exactly four values.
                let (x, y, w, h) = (values[0], values[1], values[2], values[3]);
                if w <= 0 || h <= 0 {
                    return Err("region width and height must be positive".to_string());
                }
                Some(Region {
                    x: x as i32,
                    y: y as i32,
                    width: w as u32,
                    height: h as u32,
                })
            }
            None => None,
        };

        let mut params = CaptureParams {
            output_path,
            fps: self.fps,
            duration_secs: self.time,
            enable_video: self.video,
            enable_system_audio: self.system,
            enable_microphone: self.microphone,
            monitor_index: self.monitor,
            cursor_enabled: self.cursor == "on",
            region,
            ..Default::default()
        };
        params.validate_and_finalize().map_err(|e| e.to_string())?;
        Ok(params)
    }
}

/// Timestamped default filename in the working directory.
fn default_output_name() -> PathBuf {
    PathBuf::from(format!("{}.mp4", Local::now().format("%y%m%d%H%M%S")))
}

fn describe_audio(sources: AudioSources) -> &'static str {
    match sources {
        AudioSources::None => "Disabled",
        AudioSources::System => "System audio",
        AudioSources::Microphone => "Microphone",
        AudioSources::Both => "System + Microphone",
    }
}

fn print_banner(params: &CaptureParams) {
    println!("deskmux - Starting capture...");
    println!(
        "Mode: {}",
        if params.audio_only_mode() {
            "Audio-only (MP4)"
        } else {
            "Video + Audio (MP4)"
        }
    );
    println!("Output file: {}", params.output_path.display());
    if !params.audio_only_mode() {
        println!("FPS: {}", params.fps);
        println!("Monitor: {}", params.monitor_index);
        println!(
            "Cursor: {}",
            if params.cursor_enabled { "Enabled" } else { "Disabled" }
        );
        match &params.region {
            Some(region) => println!(
                "Region: {},{} {}x{}",
                region.x, region.y, region.width, region.height
            ),
            None => println!("Region: Full screen"),
        }
    }
    println!("Audio: {}", describe_audio(params.audio_sources()));
    if params.duration_secs > 0 {
        println!("Duration: {} seconds", params.duration_secs);
    } else {
        println!("Duration: Unlimited (press Ctrl+C to stop)");
    }
    println!("Press Ctrl+C to stop recording.");
    println!();
}

fn print_summary(params: &CaptureParams, stats: &CaptureStats) {
    println!();
    println!("=== Recording Summary ===");
    if !params.audio_only_mode() {
        println!("Total frames: {}", stats.total_frames);
        println!("Failed frames: {}", stats.failed_frames);
    }
    println!("Duration: {:.2} seconds", stats.duration_ms as f64 / 1000.0);
    match &stats.audio_format {
        Some(format) if stats.audio_enabled => println!(
            "Audio: {} Hz, {} channels, {} bits",
            format.sample_rate, format.channels, format.bits_per_sample
        ),
        _ => println!("Audio: Not captured"),
    }
    if !params.audio_only_mode() && stats.total_frames > 0 && stats.duration_ms > 0 {
        println!(
            "Average FPS: {:.2}",
            stats.total_frames as f64 * 1000.0 / stats.duration_ms as f64
        );
    }
    println!("Recording saved to: {}", params.output_path.display());
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let params = match cli.into_params() {
        Ok(params) => params,
        Err(message) => {
            eprintln!("Error: {}", message);
            std::process::exit(ExitCode::GeneralError.as_i32());
        }
    };

    print_banner(&params);

    let cancel = CancelToken::new();
    let running = Arc::new(AtomicBool::new(true));
    spawn_emergency_watchdog(cancel.clone(), Arc::clone(&running));

    #[cfg(windows)]
    if let Err(err) = deskmux_core::win::install_console_handler(&cancel) {
        eprintln!("Warning: {}", err);
    }

    let mut reporter = ConsoleReporter;
    let result = record(&params, &mut reporter, &cancel);
    running.store(false, Ordering::SeqCst);

    let code = match result {
        Ok(stats) => {
            print_summary(&params, &stats);
            ExitCode::Success
        }
        Err(err) => {
            eprintln!("Recording failed: {}", err);
            ExitCode::GeneralError
        }
    };
    std::process::exit(code.as_i32());
}

#[cfg(windows)]
fn record(
    params: &CaptureParams,
    reporter: &mut ConsoleReporter,
    cancel: &CancelToken,
) -> Result<CaptureStats, deskmux_core::RecordingError> {
    deskmux_core::win::record(params, reporter, cancel)
}

#[cfg(not(windows))]
fn record(
    _params: &CaptureParams,
    _reporter: &mut ConsoleReporter,
    _cancel: &CancelToken,
) -> Result<CaptureStats, deskmux_core::RecordingError> {
    Err(deskmux_core::RecordingError::new(
        deskmux_core::CaptureError::NotSupported("screen capture requires Windows"),
        CaptureStats::default(),
    ))
}
