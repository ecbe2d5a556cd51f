//! detectxd - run the detection pipeline over recorded model output.
//!
//! Replays a directory of raw output tensors (`*.bin`, one per inference
//! cycle) through decoding, suppression, event gating and crop export, and
//! publishes the results to an MQTT broker or, with `--dry-run`, to the log.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use detectx::events::{parse_mqtt_endpoint, sweep_once, MqttSettings};
use detectx::{
    epoch_ms, spawn_expiry_sweeper, EventSink, LogSink, MqttSink, Pipeline, PipelineConfig,
    ReplayBackend, RgbFrame,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay model output through the DetectX pipeline")]
struct Args {
    /// Pipeline config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "DETECTX_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of raw output tensors, replayed in file name order.
    #[arg(long, env = "DETECTX_TENSORS")]
    tensors: PathBuf,

    /// Directory of full-resolution frames (`*.rgb` or `*.nv12`) paired with
    /// the tensors in file name order. Needed for crop export.
    #[arg(long, env = "DETECTX_FRAMES")]
    frames: Option<PathBuf>,

    /// MQTT broker address.
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    /// MQTT client identifier.
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "detectxd")]
    mqtt_client_id: String,

    /// MQTT username for authentication.
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password for authentication.
    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Log payloads instead of publishing them.
    #[arg(long)]
    dry_run: bool,

    /// Delay between inference cycles in milliseconds.
    #[arg(long, env = "DETECTX_INTERVAL_MS", default_value_t = 100)]
    interval_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = PipelineConfig::load_from(args.config.as_deref())?;
    let mut backend = ReplayBackend::from_dir(&args.tensors)?;
    let mut frames = FrameSource::open(
        args.frames.as_deref(),
        config.model.video_width,
        config.model.video_height,
    )?;
    log::info!(
        "replaying {} tensors from {}",
        backend.remaining(),
        args.tensors.display()
    );

    let mqtt = if args.dry_run {
        None
    } else {
        let endpoint = parse_mqtt_endpoint(&args.mqtt_broker_addr)?;
        Some(Arc::new(MqttSink::connect(&MqttSettings {
            endpoint,
            client_id: args.mqtt_client_id.clone(),
            username: args.mqtt_username.clone(),
            password: args.mqtt_password.clone(),
        })?))
    };
    let sink: Arc<dyn EventSink> = match &mqtt {
        Some(mqtt) => mqtt.clone() as Arc<dyn EventSink>,
        None => Arc::new(LogSink),
    };

    let serial = config.serial.clone();
    let sweep_interval = config.sweep_interval;
    let mut pipeline = Pipeline::new(config, sink.clone())?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    let sweeper = spawn_expiry_sweeper(
        pipeline.gate(),
        sink.clone(),
        serial.clone(),
        sweep_interval,
        running.clone(),
    )?;

    let interval = Duration::from_millis(args.interval_ms);
    let mut cycles = 0u64;
    while running.load(Ordering::SeqCst) && pipeline.is_running() && !backend.is_exhausted() {
        let frame = frames.next_or_skip();
        match pipeline.run_cycle(&mut backend, frame.as_ref()) {
            Ok(report) => {
                cycles += 1;
                log::debug!(
                    "cycle {}: {} detections, {} events, {} crops",
                    cycles,
                    report.detections.len(),
                    report.changes.len(),
                    report.crops_published
                );
            }
            Err(e) => log::warn!("cycle failed: {:#}", e),
        }
        std::thread::sleep(interval);
    }

    if !pipeline.is_running() {
        log::warn!("pipeline stopped after exhausting its inference error budget");
    }
    log::info!("processed {} cycles, shutting down", cycles);
    running.store(false, Ordering::SeqCst);
    sweeper
        .join()
        .map_err(|_| anyhow!("expiry sweeper panicked"))?;
    if let Err(e) = sweep_once(&pipeline.gate(), sink.as_ref(), &serial, epoch_ms()) {
        log::warn!("final expiry sweep failed: {}", e);
    }

    if let Some(mqtt) = mqtt {
        mqtt.disconnect()?;
    }
    Ok(())
}

/// Frames paired with tensors by position.
struct FrameSource {
    paths: std::vec::IntoIter<PathBuf>,
    width: u32,
    height: u32,
}

impl FrameSource {
    fn open(dir: Option<&Path>, width: u32, height: u32) -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(dir) = dir {
            paths = std::fs::read_dir(dir)
                .with_context(|| format!("failed to read frame directory {}", dir.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| {
                    path.extension()
                        .is_some_and(|ext| ext == "rgb" || ext == "nv12")
                })
                .collect();
            paths.sort();
        }
        Ok(Self {
            paths: paths.into_iter(),
            width,
            height,
        })
    }

    fn next_frame(&mut self) -> Result<Option<RgbFrame>> {
        let Some(path) = self.paths.next() else {
            return Ok(None);
        };
        let bytes = std::fs::read(&path)
            .with_context(|| format!("failed to read frame {}", path.display()))?;
        let frame = if path.extension().is_some_and(|ext| ext == "nv12") {
            RgbFrame::from_nv12(&bytes, self.width, self.height)
        } else {
            RgbFrame::new(bytes, self.width, self.height)
        };
        frame
            .map(Some)
            .with_context(|| format!("invalid frame {}", path.display()))
    }

    /// Next frame, or `None` with a warning when it cannot be read. A bad
    /// frame file never ends the run.
    fn next_or_skip(&mut self) -> Option<RgbFrame> {
        match self.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("skipping unreadable frame: {:#}", e);
                None
            }
        }
    }
}
