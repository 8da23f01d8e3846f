//! Fire-and-forget event bus. Components emit lifecycle events on a
//! broadcast channel; nobody is required to be listening — a CLI progress
//! renderer and a structured-log subscriber can both tap in independently.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(clippy::large_enum_variant)]
pub enum Event {
    PlanFrozen {
        plan_id: String,
        stage_count: usize,
        quality_score: i32,
    },
    StageStarted {
        stage_id: String,
        task_count: usize,
        pass_rule: String,
    },
    StageTaskDispatched {
        stage_id: String,
        task_id: String,
        worker_handle: String,
        attempt: u32,
    },
    StageTaskFinished {
        stage_id: String,
        task_id: String,
        status: String,
        attempt: u32,
        remaining_files: Vec<String>,
    },
    StageFinished {
        stage_id: String,
        all_success: bool,
        success_count: usize,
        fail_count: usize,
    },
    PhaseChanged {
        from: String,
        to: String,
    },
    RecoveryEntered {
        stage_id: String,
        recovery_count: u32,
    },
    GateChecked {
        gate: String,
        verdict: String,
        reason: String,
    },
    Alert {
        kind: String,
        message: String,
    },
}

/// Thin wrapper around a broadcast sender. Cloning shares the same channel.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<Event>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        EventSink { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcasts `event`. Dropped silently if no receiver is attached.
    pub fn emit(&self, event: Event) {
        trace!(?event, "event emitted");
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        sink.emit(Event::Alert {
            kind: "test".to_string(),
            message: "hello".to_string(),
        });
        let received = rx.recv().await.unwrap();
        match received {
            Event::Alert { kind, message } => {
                assert_eq!(kind, "test");
                assert_eq!(message, "hello");
            }
            _ => panic!("wrong event variant"),
        }
    }

    #[test]
    fn emit_without_subscriber_does_not_panic() {
        let sink = EventSink::new();
        sink.emit(Event::Alert {
            kind: "test".to_string(),
            message: "nobody listening".to_string(),
        });
    }
}
