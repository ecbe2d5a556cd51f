//! Debounced per-label events and their delivery.

mod gate;
mod mqtt;
mod payload;
mod sink;
mod sweeper;

pub use gate::{
    window_size_for, EventGate, GateSettings, LabelEventState, LabelState, Prioritize,
    RollingWindow, StateChange, MAX_LABELS, MAX_ROLLING, MIN_ROLLING,
};
pub use mqtt::{parse_mqtt_endpoint, MqttEndpoint, MqttSettings, MqttSink};
pub use payload::{
    crop_topic, detection_topic, detections_payload, event_topic, sanitize_label,
    state_change_payload, CropPayload,
};
pub use sink::{EventSink, LogSink, MemorySink, Published};
pub use sweeper::{publish_state_changes, sweep_once, spawn_expiry_sweeper};
