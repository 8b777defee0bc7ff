use serde::Serialize;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

/// One progress update for a model download/extract.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub model_name: String,
    /// 0.0..=1.0
    pub progress: f32,
    pub status: String,
}

/// Events buffered per subscriber before new ones are dropped for it.
pub const SUBSCRIBER_BACKLOG: usize = 256;

/// Fan-out of progress events to any number of subscribers.
///
/// Delivery is fire-and-forget: a send never blocks. A subscriber whose
/// backlog is full misses events until it drains, and subscribers that have
/// hung up are dropped on the next publish.
#[derive(Clone, Default)]
pub struct ProgressHub {
    subscribers: Arc<Mutex<Vec<SyncSender<ProgressEvent>>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::sync_channel(SUBSCRIBER_BACKLOG);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn publish(&self, model_name: &str, progress: f32, status: impl Into<String>) {
        let event = ProgressEvent {
            model_name: model_name.to_string(),
            progress: progress.clamp(0.0, 1.0),
            status: status.into(),
        };
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_every_live_subscriber() {
        let hub = ProgressHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();
        drop(b);
        hub.publish("modnet", 1.5, "done");
        let ev = a.try_recv().unwrap();
        assert_eq!(ev.progress, 1.0);
        assert_eq!(ev.model_name, "modnet");
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn idle_subscriber_backlog_is_bounded() {
        let hub = ProgressHub::new();
        let idle = hub.subscribe();
        for i in 0..SUBSCRIBER_BACKLOG * 3 {
            hub.publish("lama", i as f32 / 1000.0, "Downloading");
        }
        assert_eq!(hub.subscriber_count(), 1);
        let held: Vec<_> = idle.try_iter().collect();
        assert_eq!(held.len(), SUBSCRIBER_BACKLOG);
        assert_eq!(held[0].progress, 0.0);

        // Draining makes room again
        hub.publish("lama", 1.0, "Ready");
        assert_eq!(idle.try_recv().unwrap().status, "Ready");
    }

    #[test]
    fn events_serialize_camel_case() {
        let ev = ProgressEvent { model_name: "lama".into(), progress: 0.5, status: "Extracting".into() };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["modelName"], "lama");
    }
}
