//! iris command line: list devices, show formats, capture

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use iris::capture::frame::align4;
use iris::capture::V4l2Provider;
use iris::pipeline::DecodeMode;
use iris::{discovery, Camera, Config, DecodedFrame, FrameSink};

#[derive(Parser)]
#[command(name = "iris")]
#[command(about = "Low-latency V4L2 capture pipeline")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); IRIS__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List capture devices with their USB ids
    List,

    /// Show the pixel formats and frame sizes of a device
    Formats {
        /// Device node, e.g. /dev/video0
        device: PathBuf,
    },

    /// Stream from a device and report frame statistics
    Capture {
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// JPEG or YUYV
        #[arg(short, long)]
        encoding: Option<String>,

        /// Frame size as W*H
        #[arg(short, long)]
        resolution: Option<String>,

        /// sync, async or pingpong
        #[arg(short, long)]
        mode: Option<DecodeMode>,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        duration: Option<u64>,

        /// Parameter file to apply after the defaults
        #[arg(short, long)]
        params: Option<PathBuf>,

        /// Write the first decoded frame to this PNG file
        #[arg(short, long)]
        snapshot: Option<PathBuf>,
    },
}

/// What the reporter learns about each delivered frame
#[derive(Debug, Clone, Copy)]
struct FrameSummary {
    width: u32,
    height: u32,
    channels: u32,
    at: Instant,
}

struct Snapshot {
    width: u32,
    height: u32,
    channels: u32,
    pixels: Vec<u8>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("iris=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).wrap_err("failed to load configuration")?;

    match cli.command {
        Commands::List => list_devices(),
        Commands::Formats { device } => show_formats(&device),
        Commands::Capture {
            device,
            encoding,
            resolution,
            mode,
            duration,
            params,
            snapshot,
        } => {
            let mut config = config;
            if let Some(device) = device {
                config.capture.device = device;
            }
            if let Some(encoding) = encoding {
                config.capture.encoding = encoding;
            }
            if let Some(mode) = mode {
                config.decode.mode = mode;
            }
            if params.is_some() {
                config.params.file = params;
            }
            let resolution = resolution.unwrap_or_else(|| config.capture.resolution());
            capture(config, resolution, duration.map(Duration::from_secs), snapshot).await
        }
    }
}

fn list_devices() -> Result<()> {
    let provider = V4l2Provider::default();
    let devices = discovery::enumerate(&provider)?;
    if devices.is_empty() {
        println!("no capture devices found");
    }
    for device in devices {
        println!(
            "{}  {:04x}:{:04x}",
            device.path.display(),
            device.vendor_id,
            device.product_id
        );
    }
    Ok(())
}

fn show_formats(device: &Path) -> Result<()> {
    let provider = V4l2Provider::default();
    for format in discovery::pixel_formats(&provider, device)? {
        println!("{} ({})", format.pixel_format, format.description);
        let sizes = discovery::resolutions(&provider, device, format.pixel_format.name())?;
        for size in sizes {
            println!("    {size}");
        }
    }
    Ok(())
}

async fn capture(
    config: Config,
    resolution: String,
    duration: Option<Duration>,
    snapshot: Option<PathBuf>,
) -> Result<()> {
    let (summary_tx, summary_rx) = flume::bounded::<FrameSummary>(64);
    let (snapshot_tx, snapshot_rx) = flume::bounded::<Snapshot>(1);
    let want_snapshot = snapshot.is_some();

    let sink = FrameSink::new(move |frame: DecodedFrame<'_>| {
        // A full channel means the reporter is behind; the summary is
        // simply lost.
        let _ = summary_tx.try_send(FrameSummary {
            width: frame.width,
            height: frame.height,
            channels: frame.channels,
            at: Instant::now(),
        });
        if want_snapshot && snapshot_tx.is_empty() {
            let _ = snapshot_tx.try_send(Snapshot {
                width: frame.width,
                height: frame.height,
                channels: frame.channels,
                pixels: frame.pixels.to_vec(),
            });
        }
    });

    let provider = Arc::new(V4l2Provider::default());
    let mut camera = Camera::from_config(provider, &config, sink);
    camera
        .start(&config.capture.device, &config.capture.encoding, &resolution)
        .wrap_err_with(|| format!("failed to start {}", config.capture.device.display()))?;
    info!(
        device = %config.capture.device.display(),
        mode = %camera.mode(),
        "capturing, press Ctrl-C to stop"
    );

    let reporter = tokio::spawn(report(summary_rx));

    match duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    camera.stop();
    let stats = camera.stats();
    // Dropping the camera drops the sink and closes the summary channel.
    drop(camera);
    if let Err(err) = reporter.await {
        warn!(%err, "reporter task failed");
    }

    info!(
        samples = stats.samples,
        decoded = stats.decoded,
        dropped = stats.dropped,
        failed = stats.failed,
        "capture finished"
    );

    if let Some(path) = snapshot {
        let shot = snapshot_rx
            .try_recv()
            .map_err(|_| eyre!("no frame was decoded, snapshot not written"))?;
        save_png(&shot, &path)?;
        info!(path = %path.display(), "snapshot written");
    }
    Ok(())
}

async fn report(frames: flume::Receiver<FrameSummary>) {
    let mut window = 0u32;
    let mut window_start = Instant::now();
    let mut last: Option<FrameSummary> = None;

    while let Ok(frame) = frames.recv_async().await {
        window += 1;
        last = Some(frame);
        let elapsed = frame.at.duration_since(window_start);
        if elapsed >= Duration::from_secs(1) {
            info!(
                fps = %format!("{:.1}", window as f64 / elapsed.as_secs_f64()),
                size = %format_args!("{}x{}", frame.width, frame.height),
                channels = frame.channels,
                "frames"
            );
            window = 0;
            window_start = frame.at;
        }
    }

    if last.is_none() {
        warn!("no frames were delivered");
    }
}

fn save_png(shot: &Snapshot, path: &Path) -> Result<()> {
    let (w, h) = (shot.width as usize, shot.height as usize);
    let image = match shot.channels {
        3 => {
            let stride = align4(w * 3);
            let mut rgb = Vec::with_capacity(w * h * 3);
            for row in shot.pixels.chunks(stride).take(h) {
                rgb.extend_from_slice(&row[..w * 3]);
            }
            image::RgbImage::from_raw(shot.width, shot.height, rgb)
                .map(image::DynamicImage::ImageRgb8)
        }
        _ => {
            let mut rgba = shot.pixels[..w * h * 4].to_vec();
            // BGRA -> RGBA
            for px in rgba.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
            image::RgbaImage::from_raw(shot.width, shot.height, rgba)
                .map(image::DynamicImage::ImageRgba8)
        }
    }
    .ok_or_else(|| eyre!("snapshot buffer does not match {}x{}", shot.width, shot.height))?;

    image
        .save_with_format(path, image::ImageFormat::Png)
        .wrap_err_with(|| format!("failed to write {}", path.display()))
}
