use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::warn;

use crate::epoch_ms;
use crate::events::gate::{EventGate, StateChange};
use crate::events::payload::{event_topic, state_change_payload};
use crate::events::sink::EventSink;

/// Publish each state change on its event topic.
///
/// Failures are logged and skipped. Returns how many publishes succeeded.
pub fn publish_state_changes(sink: &dyn EventSink, serial: &str, changes: &[StateChange]) -> usize {
    let mut published = 0;
    for change in changes {
        let topic = event_topic(serial, &change.label, change.state);
        let result = state_change_payload(change).and_then(|payload| sink.publish(&topic, &payload));
        match result {
            Ok(()) => published += 1,
            Err(e) => warn!("failed to publish {}: {}", topic, e),
        }
    }
    published
}

/// Run one timeout pass against the shared gate and publish the falling edges.
///
/// Publishing happens with the gate locked, so edges for one label reach the
/// sink in the order the gate produced them.
pub fn sweep_once(
    gate: &Mutex<EventGate>,
    sink: &dyn EventSink,
    serial: &str,
    now_ms: u64,
) -> Result<Vec<StateChange>> {
    let mut gate = gate
        .lock()
        .map_err(|_| anyhow!("event gate lock poisoned"))?;
    let changes = gate.deactivate_expired(now_ms);
    publish_state_changes(sink, serial, &changes);
    Ok(changes)
}

/// Start the periodic timeout sweep on its own thread.
///
/// The thread exits once `running` is cleared.
pub fn spawn_expiry_sweeper(
    gate: Arc<Mutex<EventGate>>,
    sink: Arc<dyn EventSink>,
    serial: String,
    interval: Duration,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("detectx-sweeper".to_string())
        .spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(interval);
                if let Err(e) = sweep_once(&gate, sink.as_ref(), &serial, epoch_ms()) {
                    warn!("expiry sweep failed: {}", e);
                }
            }
        })
        .map_err(|e| anyhow!("failed to spawn expiry sweeper: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detection;
    use crate::events::gate::{GateSettings, Prioritize};
    use crate::events::sink::MemorySink;

    fn speed_gate() -> EventGate {
        EventGate::new(GateSettings {
            prioritize: Prioritize::Speed,
            min_event_duration_ms: 1000,
            ..GateSettings::default()
        })
    }

    #[test]
    fn sweep_publishes_falling_edges() {
        let mut gate = speed_gate();
        let mut dets = vec![Detection::new("person", 80.0, 0.0, 0.0, 1.0, 1.0)];
        gate.observe(&mut dets, 1_000, 4);
        let gate = Mutex::new(gate);
        let sink = MemorySink::new();

        assert!(sweep_once(&gate, &sink, "SERIAL", 1_500).unwrap().is_empty());
        let changes = sweep_once(&gate, &sink, "SERIAL", 2_001).unwrap();
        assert_eq!(changes.len(), 1);

        let published = sink.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "event/SERIAL/person/false");
        assert_eq!(published[0].payload["state"], false);
        assert_eq!(published[0].payload["timestamp"], 2_001);
    }

    #[test]
    fn sweeper_thread_stops_when_flag_clears() {
        let gate = Arc::new(Mutex::new(speed_gate()));
        let sink: Arc<dyn EventSink> = Arc::new(MemorySink::new());
        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_expiry_sweeper(
            gate,
            sink,
            "SERIAL".to_string(),
            Duration::from_millis(5),
            running.clone(),
        )
        .unwrap();
        running.store(false, Ordering::SeqCst);
        assert!(handle.join().is_ok());
    }

    #[test]
    fn sweeper_thread_lowers_expired_labels() {
        let mut gate = speed_gate();
        let mut dets = vec![Detection::new("car", 80.0, 0.0, 0.0, 1.0, 1.0)];
        gate.observe(&mut dets, 0, 4);
        let gate = Arc::new(Mutex::new(gate));
        let memory = Arc::new(MemorySink::new());
        let sink: Arc<dyn EventSink> = memory.clone();
        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_expiry_sweeper(
            gate.clone(),
            sink,
            "SERIAL".to_string(),
            Duration::from_millis(5),
            running.clone(),
        )
        .unwrap();

        for _ in 0..200 {
            if !memory.published().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        assert_eq!(memory.topics(), vec!["event/SERIAL/car/false"]);
    }
}
