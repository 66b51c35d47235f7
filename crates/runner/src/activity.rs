use farmhand_engine::Engine;
use farmhand_protocol::Severity;
use serde_json::Value;

/// Per-action activity sink, handed to whoever needs to report outcomes.
///
/// Every entry becomes a `tracing` event; when a store is attached it is also
/// written to the `bot_logs` table. Storage failures never propagate.
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    engine: Option<Engine>,
}

impl ActivityLog {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Some(engine),
        }
    }

    pub fn console_only() -> Self {
        Self::default()
    }

    pub fn record(&self, action: &str, severity: Severity, message: &str, details: Value) {
        match severity {
            Severity::Debug => tracing::debug!(action, %details, "{message}"),
            Severity::Info | Severity::Success => tracing::info!(action, %details, "{message}"),
            Severity::Warn => tracing::warn!(action, %details, "{message}"),
            Severity::Error => tracing::error!(action, %details, "{message}"),
        }

        let Some(engine) = &self.engine else {
            return;
        };
        let mut payload = match details {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("data".into(), other);
                map
            }
        };
        payload.insert("message".into(), Value::String(message.to_string()));
        if let Err(e) = engine.append_log(action, severity, &Value::Object(payload)) {
            tracing::warn!(action, error = %e, "activity log write failed");
        }
    }

    pub fn info(&self, action: &str, message: &str, details: Value) {
        self.record(action, Severity::Info, message, details);
    }

    pub fn success(&self, action: &str, message: &str, details: Value) {
        self.record(action, Severity::Success, message, details);
    }

    pub fn warn(&self, action: &str, message: &str, details: Value) {
        self.record(action, Severity::Warn, message, details);
    }

    pub fn error(&self, action: &str, message: &str, details: Value) {
        self.record(action, Severity::Error, message, details);
    }
}
