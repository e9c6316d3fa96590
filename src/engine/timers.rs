// Weft Engine — One-shot timers
//
// `timer_create` registers a timer; at expiry the manager emits the named
// event and then the generic `timer_fire`, with the timer record attached to
// the context under `timer`. Timers are tokio sleeps tracked in a shared map
// so `timer_cancel` can abort them; process stop clears the map.

use crate::engine::context::SyntheticEvent;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

pub struct TimerManager {
    events_tx: UnboundedSender<SyntheticEvent>,
    handles: Arc<Mutex<HashMap<String, tokio::task::AbortHandle>>>,
}

impl TimerManager {
    pub fn new(events_tx: UnboundedSender<SyntheticEvent>) -> Self {
        TimerManager { events_tx, handles: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Register a one-shot timer. Returns the timer id (generated when the
    /// caller did not provide one). Re-creating an id replaces the pending
    /// timer.
    pub fn create(
        &self,
        id: Option<String>,
        event: String,
        data: Value,
        duration_ms: u64,
    ) -> String {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let expires_at = crate::engine::storage::now_ms() + duration_ms as i64;

        let tx = self.events_tx.clone();
        let handles = Arc::clone(&self.handles);
        let timer_id = id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
            handles.lock().remove(&timer_id);
            let record = json!({
                "id": timer_id,
                "event": event,
                "data": data,
                "expiresAt": expires_at,
            });
            // Named event first, then the generic fire event.
            let _ = tx.send(SyntheticEvent { name: event.clone(), data: record.clone() });
            let _ = tx.send(SyntheticEvent { name: "timer_fire".into(), data: record });
        });

        if let Some(old) = self.handles.lock().insert(id.clone(), task.abort_handle()) {
            old.abort();
        }
        log::debug!("[timers] Created timer {id} ({duration_ms}ms)");
        id
    }

    /// Cancel a pending timer. Returns whether one was pending.
    pub fn cancel(&self, id: &str) -> bool {
        match self.handles.lock().remove(id) {
            Some(handle) => {
                handle.abort();
                log::debug!("[timers] Cancelled timer {id}");
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.handles.lock().len()
    }

    /// Abort every pending timer (process stop).
    pub fn clear(&self) {
        let mut handles = self.handles.lock();
        for (_, handle) in handles.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_named_event_then_timer_fire() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let timers = TimerManager::new(tx);
        timers.create(Some("t1".into()), "giveaway_end".into(), json!({"giveaway": 7}), 10);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name, "giveaway_end");
        assert_eq!(first.data["id"], json!("t1"));
        assert_eq!(first.data["data"]["giveaway"], json!(7));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.name, "timer_fire");
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test]
    async fn cancel_prevents_fire() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let timers = TimerManager::new(tx);
        timers.create(Some("t2".into()), "never".into(), Value::Null, 20);
        assert!(timers.cancel("t2"));
        assert!(!timers.cancel("t2"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
