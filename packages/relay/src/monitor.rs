use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::broadcast;

/// Fan-out of internal gateway events to monitor dashboards on `/events`.
///
/// A lagging or disconnected subscriber just loses events; publishing never
/// blocks request handling.
#[derive(Debug, Clone)]
pub struct Monitor {
    tx: broadcast::Sender<Value>,
}

impl Monitor {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Publish an event. `fields` must be a JSON object; `type` and
    /// `timestamp` are filled in here.
    pub fn publish(&self, kind: &str, fields: Value) {
        let mut event = match fields {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        event.insert("type".to_string(), Value::String(kind.to_string()));
        event.insert("timestamp".to_string(), Value::String(timestamp()));
        // Only fails when nobody is listening.
        let _ = self.tx.send(Value::Object(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// The greeting sent to each new `/events` subscriber.
    pub fn connected_event(&self) -> Value {
        json!({"type": "connected", "timestamp": timestamp()})
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}
