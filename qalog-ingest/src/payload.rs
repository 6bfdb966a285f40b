use qalog_core::models::{Body, EventKind};
use serde::Deserialize;
use serde_json::Value;

/// Hook payload as posted by the browser or backend instrumentation.
/// Scalars that hooks send either as strings or numbers stay loosely typed
/// until read through the accessors.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestPayload {
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub program_name: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<Value>,
    #[serde(default, rename = "type")]
    pub kind: Option<EventKind>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub request: Option<Body>,
    #[serde(default)]
    pub response: Option<Body>,
    #[serde(default)]
    pub status: Option<Value>,
}

impl IngestPayload {
    pub fn from_value(value: Value) -> Result<Self, String> {
        if !value.is_object() {
            return Err("payload must be a JSON object".to_string());
        }
        serde_json::from_value(value).map_err(|e| e.to_string())
    }

    pub fn timestamp(&self) -> Option<String> {
        self.timestamp.as_ref().and_then(scalar_to_string)
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.as_ref().and_then(scalar_to_string)
    }

    pub fn status_code(&self) -> Option<i32> {
        match self.status.as_ref()? {
            Value::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn program(&self) -> Option<&str> {
        self.program_name
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(i.to_string()),
            None => n.as_f64().map(|f| (f.trunc() as i64).to_string()),
        },
        _ => None,
    }
}
