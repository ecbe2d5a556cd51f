use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use log::debug;

use crate::detect::Detection;

/// Hard cap on distinct labels tracked by one gate.
pub const MAX_LABELS: usize = 32;
/// Hard cap on the rolling window size.
pub const MAX_ROLLING: usize = 16;
/// Lower bound on the rolling window size.
pub const MIN_ROLLING: usize = 2;

/// Temporal strategy for raising events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Prioritize {
    /// Raise on the first detection.
    Speed,
    /// Raise once enough of the recent cycles contained the label.
    #[default]
    Accuracy,
}

impl Prioritize {
    pub fn as_str(self) -> &'static str {
        match self {
            Prioritize::Speed => "speed",
            Prioritize::Accuracy => "accuracy",
        }
    }
}

impl FromStr for Prioritize {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "speed" => Ok(Prioritize::Speed),
            "accuracy" => Ok(Prioritize::Accuracy),
            other => Err(anyhow!(
                "unknown prioritize mode '{}', expected 'speed' or 'accuracy'",
                other
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LabelState {
    #[default]
    Low,
    High,
}

impl LabelState {
    pub fn is_high(self) -> bool {
        self == LabelState::High
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateSettings {
    pub prioritize: Prioritize,
    /// A HIGH label falls once this long has passed without a detection.
    pub min_event_duration_ms: u64,
    /// Target rolling window duration for accuracy mode.
    pub window_ms: u64,
    /// Hits inside the window needed to raise in accuracy mode.
    pub min_frames: usize,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            prioritize: Prioritize::Accuracy,
            min_event_duration_ms: 3000,
            window_ms: 1000,
            min_frames: 3,
        }
    }
}

/// Rolling window size for the current average inference latency.
///
/// Without a usable latency sample the window is as large as allowed.
pub fn window_size_for(window_ms: u64, average_latency_ms: Option<f64>) -> usize {
    match average_latency_ms {
        Some(avg) if avg.is_finite() && avg > 0.0 => {
            let frames = ((window_ms as f64 + avg - 1.0) / avg) as usize;
            frames.clamp(MIN_ROLLING, MAX_ROLLING)
        }
        _ => MAX_ROLLING,
    }
}

/// Ring buffer of per-cycle presence bits.
///
/// Slots are reused when the window size changes between cycles, so a window
/// that grows can briefly count bits older than its nominal duration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RollingWindow {
    slots: [bool; MAX_ROLLING],
    head: usize,
    count: usize,
}

impl RollingWindow {
    pub fn push(&mut self, present: bool, window_size: usize) {
        let size = window_size.clamp(1, MAX_ROLLING);
        self.head = (self.head + 1) % size;
        self.slots[self.head] = present;
        self.count = (self.count + 1).min(size);
    }

    /// Number of presence bits inside the first `window_size` slots.
    pub fn hits(&self, window_size: usize) -> usize {
        let size = window_size.clamp(1, MAX_ROLLING);
        self.slots[..size].iter().filter(|bit| **bit).count()
    }

    /// Slots written so far, capped at the window size.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Per-label event state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelEventState {
    pub state: LabelState,
    pub window: RollingWindow,
    pub last_detect_ms: u64,
}

/// A LOW/HIGH transition of one label.
#[derive(Clone, Debug, PartialEq)]
pub struct StateChange {
    pub label: String,
    pub state: LabelState,
    pub timestamp: u64,
    /// The detection that raised the label, for rising edges.
    pub detection: Option<Detection>,
}

impl StateChange {
    pub fn is_rising(&self) -> bool {
        self.state.is_high()
    }
}

/// Converts per-cycle detections into debounced per-label events.
///
/// Rising edges happen inside `observe`; the only way back to LOW is
/// `deactivate_expired`, which the timeout sweep calls on its own schedule.
#[derive(Debug)]
pub struct EventGate {
    settings: GateSettings,
    max_labels: usize,
    labels: HashMap<String, LabelEventState>,
}

impl EventGate {
    pub fn new(settings: GateSettings) -> Self {
        Self::with_max_labels(settings, MAX_LABELS)
    }

    pub fn with_max_labels(settings: GateSettings, max_labels: usize) -> Self {
        Self {
            settings,
            max_labels,
            labels: HashMap::new(),
        }
    }

    pub fn settings(&self) -> GateSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: GateSettings) {
        self.settings = settings;
    }

    /// Feed one inference cycle.
    ///
    /// Every label present in `detections` counts once for the cycle; its first
    /// detection is the one marked with `state = true` when the label rises.
    /// In accuracy mode every other tracked label records an absence.
    pub fn observe(
        &mut self,
        detections: &mut [Detection],
        now_ms: u64,
        window_size: usize,
    ) -> Vec<StateChange> {
        let settings = self.settings;
        let mut changes = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for det in detections.iter_mut() {
            if !seen.insert(det.label.clone()) {
                continue;
            }
            let Some(entry) = self.entry_mut(&det.label) else {
                continue;
            };

            let rising = match settings.prioritize {
                Prioritize::Speed => entry.state == LabelState::Low,
                Prioritize::Accuracy => {
                    entry.window.push(true, window_size);
                    entry.state == LabelState::Low
                        && entry.window.hits(window_size) >= settings.min_frames
                }
            };
            entry.last_detect_ms = now_ms;

            if rising {
                entry.state = LabelState::High;
                det.state = Some(true);
                debug!("label '{}' set HIGH", det.label);
                changes.push(StateChange {
                    label: det.label.clone(),
                    state: LabelState::High,
                    timestamp: now_ms,
                    detection: Some(det.clone()),
                });
            }
        }

        if settings.prioritize == Prioritize::Accuracy {
            for (label, entry) in self.labels.iter_mut() {
                if !seen.contains(label) {
                    entry.window.push(false, window_size);
                }
            }
        }

        changes
    }

    /// Drop every HIGH label whose last detection is older than the minimum
    /// event duration. Changes come back ordered by label.
    pub fn deactivate_expired(&mut self, now_ms: u64) -> Vec<StateChange> {
        let min_duration = self.settings.min_event_duration_ms;
        let mut changes: Vec<StateChange> = self
            .labels
            .iter_mut()
            .filter(|(_, entry)| entry.state.is_high())
            .filter(|(_, entry)| now_ms.saturating_sub(entry.last_detect_ms) > min_duration)
            .map(|(label, entry)| {
                entry.state = LabelState::Low;
                debug!("label '{}' set LOW", label);
                StateChange {
                    label: label.clone(),
                    state: LabelState::Low,
                    timestamp: now_ms,
                    detection: None,
                }
            })
            .collect();
        changes.sort_by(|a, b| a.label.cmp(&b.label));
        changes
    }

    pub fn state_of(&self, label: &str) -> Option<LabelState> {
        self.labels.get(label).map(|entry| entry.state)
    }

    pub fn label_state(&self, label: &str) -> Option<&LabelEventState> {
        self.labels.get(label)
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Forget every label.
    pub fn reset(&mut self) {
        self.labels.clear();
    }

    fn entry_mut(&mut self, label: &str) -> Option<&mut LabelEventState> {
        if !self.labels.contains_key(label) {
            if self.labels.len() >= self.max_labels {
                debug!("label table full; '{}' not tracked", label);
                return None;
            }
            self.labels
                .insert(label.to_string(), LabelEventState::default());
        }
        self.labels.get_mut(label)
    }
}
