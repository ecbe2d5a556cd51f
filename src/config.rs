use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::crop::{Borders, CropSettings};
use crate::detect::{BoxDecoder, Normalizer, Quantization, TensorLayout};
use crate::events::{GateSettings, Prioritize};

const DEFAULT_MODEL_WIDTH: u32 = 640;
const DEFAULT_MODEL_HEIGHT: u32 = 640;
const DEFAULT_VIDEO_WIDTH: u32 = 1280;
const DEFAULT_VIDEO_HEIGHT: u32 = 720;
const DEFAULT_BOXES: usize = 25200;
const DEFAULT_CLASSES: usize = 80;
const DEFAULT_OBJECTNESS: f32 = 0.25;
const DEFAULT_CONFIDENCE: f32 = 0.30;
const DEFAULT_NMS: f32 = 0.05;
const DEFAULT_MIN_EVENT_DURATION_MS: u64 = 3000;
const DEFAULT_WINDOW_MS: u64 = 1000;
const DEFAULT_MIN_FRAMES: usize = 3;
const DEFAULT_CROP_THROTTLE_MS: u64 = 500;
const DEFAULT_MAX_INFERENCE_ERRORS: u32 = 5;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 200;
const DEFAULT_SERIAL: &str = "UNKNOWN";

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    model: Option<ModelConfigFile>,
    settings: Option<SettingsConfigFile>,
    device: Option<DeviceConfigFile>,
    runtime: Option<RuntimeConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ModelConfigFile {
    model_width: Option<u32>,
    model_height: Option<u32>,
    video_width: Option<u32>,
    video_height: Option<u32>,
    boxes: Option<usize>,
    classes: Option<usize>,
    quant: Option<f32>,
    zero_point: Option<f32>,
    objectness: Option<f32>,
    confidence: Option<f32>,
    nms: Option<f32>,
    labels: Option<Vec<String>>,
    normalized_output: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SettingsConfigFile {
    prioritize: Option<String>,
    min_event_duration: Option<u64>,
    event_logic: Option<EventLogicConfigFile>,
    cropping: Option<CroppingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct EventLogicConfigFile {
    frames: Option<usize>,
    window: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CroppingConfigFile {
    active: Option<bool>,
    mqtt: Option<bool>,
    throttle: Option<u64>,
    leftborder: Option<u32>,
    rightborder: Option<u32>,
    topborder: Option<u32>,
    bottomborder: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DeviceConfigFile {
    serial: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RuntimeConfigFile {
    max_inference_errors: Option<u32>,
    sweep_interval_ms: Option<u64>,
}

/// Fully resolved pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub model: ModelSettings,
    pub gate: GateSettings,
    pub cropping: CroppingSettings,
    /// Device serial used in every topic.
    pub serial: String,
    pub max_inference_errors: u32,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model_width: u32,
    pub model_height: u32,
    pub video_width: u32,
    pub video_height: u32,
    pub boxes: usize,
    pub classes: usize,
    pub quant: f32,
    pub zero_point: f32,
    pub objectness: f32,
    pub confidence: f32,
    pub nms: f32,
    pub labels: Vec<String>,
    /// Model output geometry is already in `[0,1]`.
    pub normalized_output: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CroppingSettings {
    pub active: bool,
    /// Publish crops on the crop topic.
    pub mqtt_export: bool,
    pub throttle_ms: u64,
    pub borders: Borders,
}

impl ModelSettings {
    pub fn layout(&self) -> TensorLayout {
        TensorLayout::new(self.boxes, self.classes)
    }

    pub fn quantization(&self) -> Quantization {
        Quantization::new(self.quant, self.zero_point)
    }

    pub fn decoder(&self) -> BoxDecoder {
        BoxDecoder::new(self.layout(), self.quantization())
            .with_thresholds(self.objectness, self.confidence)
            .with_labels(self.labels.clone())
    }

    pub fn normalizer(&self) -> Normalizer {
        Normalizer::new(self.model_width, self.model_height, self.normalized_output)
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_width: DEFAULT_MODEL_WIDTH,
            model_height: DEFAULT_MODEL_HEIGHT,
            video_width: DEFAULT_VIDEO_WIDTH,
            video_height: DEFAULT_VIDEO_HEIGHT,
            boxes: DEFAULT_BOXES,
            classes: DEFAULT_CLASSES,
            quant: 1.0,
            zero_point: 0.0,
            objectness: DEFAULT_OBJECTNESS,
            confidence: DEFAULT_CONFIDENCE,
            nms: DEFAULT_NMS,
            labels: Vec::new(),
            normalized_output: true,
        }
    }
}

impl CroppingSettings {
    pub fn crop_settings(&self) -> CropSettings {
        CropSettings {
            active: self.active,
            borders: self.borders,
        }
    }
}

impl Default for CroppingSettings {
    fn default() -> Self {
        Self {
            active: false,
            mqtt_export: false,
            throttle_ms: DEFAULT_CROP_THROTTLE_MS,
            borders: Borders::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: ModelSettings::default(),
            gate: GateSettings {
                prioritize: Prioritize::Accuracy,
                min_event_duration_ms: DEFAULT_MIN_EVENT_DURATION_MS,
                window_ms: DEFAULT_WINDOW_MS,
                min_frames: DEFAULT_MIN_FRAMES,
            },
            cropping: CroppingSettings::default(),
            serial: DEFAULT_SERIAL.to_string(),
            max_inference_errors: DEFAULT_MAX_INFERENCE_ERRORS,
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
        }
    }
}

impl PipelineConfig {
    /// Load from the file named by `DETECTX_CONFIG` (if any), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DETECTX_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let defaults = Self::default();

        let model = match file.model {
            Some(m) => {
                let d = defaults.model.clone();
                ModelSettings {
                    model_width: m.model_width.unwrap_or(d.model_width),
                    model_height: m.model_height.unwrap_or(d.model_height),
                    video_width: m.video_width.unwrap_or(d.video_width),
                    video_height: m.video_height.unwrap_or(d.video_height),
                    boxes: m.boxes.unwrap_or(d.boxes),
                    classes: m.classes.unwrap_or(d.classes),
                    quant: m.quant.unwrap_or(d.quant),
                    zero_point: m.zero_point.unwrap_or(d.zero_point),
                    objectness: m.objectness.unwrap_or(d.objectness),
                    confidence: m.confidence.unwrap_or(d.confidence),
                    nms: m.nms.unwrap_or(d.nms),
                    labels: m.labels.unwrap_or(d.labels),
                    normalized_output: m.normalized_output.unwrap_or(d.normalized_output),
                }
            }
            None => defaults.model.clone(),
        };

        let settings = file.settings.unwrap_or_default();
        let prioritize = match settings.prioritize.as_deref() {
            Some(value) => value.parse::<Prioritize>()?,
            None => defaults.gate.prioritize,
        };
        let event_logic = settings.event_logic.unwrap_or_default();
        let gate = GateSettings {
            prioritize,
            min_event_duration_ms: settings
                .min_event_duration
                .unwrap_or(defaults.gate.min_event_duration_ms),
            window_ms: event_logic.window.unwrap_or(defaults.gate.window_ms),
            min_frames: event_logic.frames.unwrap_or(defaults.gate.min_frames),
        };

        let cropping = settings.cropping.unwrap_or_default();
        let cropping = CroppingSettings {
            active: cropping.active.unwrap_or(defaults.cropping.active),
            mqtt_export: cropping.mqtt.unwrap_or(defaults.cropping.mqtt_export),
            throttle_ms: cropping.throttle.unwrap_or(defaults.cropping.throttle_ms),
            borders: Borders {
                left: cropping.leftborder.unwrap_or(0),
                right: cropping.rightborder.unwrap_or(0),
                top: cropping.topborder.unwrap_or(0),
                bottom: cropping.bottomborder.unwrap_or(0),
            },
        };

        let serial = file
            .device
            .and_then(|device| device.serial)
            .unwrap_or(defaults.serial);
        let runtime = file.runtime.unwrap_or_default();

        Ok(Self {
            model,
            gate,
            cropping,
            serial,
            max_inference_errors: runtime
                .max_inference_errors
                .unwrap_or(defaults.max_inference_errors),
            sweep_interval: runtime
                .sweep_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(serial) = std::env::var("DETECTX_SERIAL") {
            if !serial.trim().is_empty() {
                self.serial = serial.trim().to_string();
            }
        }
        if let Ok(prioritize) = std::env::var("DETECTX_PRIORITIZE") {
            if !prioritize.trim().is_empty() {
                self.gate.prioritize = prioritize.parse()?;
            }
        }
        if let Ok(duration) = std::env::var("DETECTX_MIN_EVENT_DURATION_MS") {
            self.gate.min_event_duration_ms = duration.trim().parse().map_err(|_| {
                anyhow!("DETECTX_MIN_EVENT_DURATION_MS must be an integer number of milliseconds")
            })?;
        }
        if let Ok(cropping) = std::env::var("DETECTX_CROPPING") {
            self.cropping.active = parse_bool(&cropping)
                .ok_or_else(|| anyhow!("DETECTX_CROPPING must be true or false"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let model = &self.model;
        if model.boxes == 0 || model.classes == 0 {
            return Err(anyhow!("model boxes and classes must be greater than zero"));
        }
        if !model.quant.is_finite() || model.quant <= 0.0 {
            return Err(anyhow!("model quant scale must be positive"));
        }
        if model.model_width == 0 || model.model_height == 0 {
            return Err(anyhow!("model dimensions must be greater than zero"));
        }
        if model.video_width == 0 || model.video_height == 0 {
            return Err(anyhow!("video dimensions must be greater than zero"));
        }
        if model.labels.len() > model.classes {
            return Err(anyhow!(
                "{} labels configured for a model with {} classes",
                model.labels.len(),
                model.classes
            ));
        }
        if self.gate.min_frames < 1 {
            return Err(anyhow!("eventLogic frames must be at least 1"));
        }
        if self.serial.trim().is_empty() {
            return Err(anyhow!("device serial must not be empty"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_json(raw: &str) -> Result<PipelineConfig> {
        let file: PipelineConfigFile = serde_json::from_str(raw)?;
        let cfg = PipelineConfig::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = parse_json("{}").unwrap();
        assert_eq!(cfg.model, ModelSettings::default());
        assert_eq!(cfg.gate.prioritize, Prioritize::Accuracy);
        assert_eq!(cfg.gate.min_frames, 3);
        assert_eq!(cfg.cropping.throttle_ms, 500);
        assert_eq!(cfg.max_inference_errors, 5);
        assert_eq!(cfg.sweep_interval, Duration::from_millis(200));
    }

    #[test]
    fn camel_case_sections_are_read() {
        let cfg = parse_json(
            r#"{
                "model": {"modelWidth": 480, "zeroPoint": 12, "labels": ["person", "car"], "classes": 2},
                "settings": {
                    "prioritize": "speed",
                    "minEventDuration": 5000,
                    "eventLogic": {"frames": 2, "window": 800},
                    "cropping": {"active": true, "mqtt": true, "throttle": 250, "leftborder": 10}
                },
                "device": {"serial": "B8A44F000001"}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.model.model_width, 480);
        assert_eq!(cfg.model.zero_point, 12.0);
        assert_eq!(cfg.model.labels, vec!["person", "car"]);
        assert_eq!(cfg.gate.prioritize, Prioritize::Speed);
        assert_eq!(cfg.gate.min_event_duration_ms, 5000);
        assert_eq!(cfg.gate.window_ms, 800);
        assert_eq!(cfg.gate.min_frames, 2);
        assert!(cfg.cropping.active && cfg.cropping.mqtt_export);
        assert_eq!(cfg.cropping.borders.left, 10);
        assert_eq!(cfg.serial, "B8A44F000001");
    }

    #[test]
    fn unknown_prioritize_is_rejected() {
        assert!(parse_json(r#"{"settings": {"prioritize": "fast"}}"#).is_err());
    }

    #[test]
    fn zero_frames_is_rejected() {
        assert!(parse_json(r#"{"settings": {"eventLogic": {"frames": 0}}}"#).is_err());
    }

    #[test]
    fn bad_model_shapes_are_rejected() {
        assert!(parse_json(r#"{"model": {"boxes": 0}}"#).is_err());
        assert!(parse_json(r#"{"model": {"quant": 0.0}}"#).is_err());
        assert!(parse_json(r#"{"model": {"videoWidth": 0}}"#).is_err());
        assert!(parse_json(r#"{"model": {"classes": 1, "labels": ["a", "b"]}}"#).is_err());
    }

    #[test]
    fn model_settings_build_collaborators() {
        let model = ModelSettings {
            boxes: 2,
            classes: 3,
            ..ModelSettings::default()
        };
        assert_eq!(model.decoder().layout(), TensorLayout::new(2, 3));
        assert_eq!(model.quantization(), Quantization::new(1.0, 0.0));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
