use serde::{Deserialize, Serialize};

/// Which hook produced an ingested payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Frontend,
    Backend,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum QaLogRequest {
    Ping,
    Health,
    Ingest {
        channel: Channel,
        payload: serde_json::Value,
        #[serde(default)]
        peer: Option<String>,
    },
    Status {
        program: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QaLogResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub version: String,
}

impl QaLogResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_tagging() {
        let req: QaLogRequest = serde_json::from_value(serde_json::json!({
            "action": "ingest",
            "channel": "backend",
            "payload": {"timestamp": "2026-01-01T00:00:00Z"}
        }))
        .unwrap();
        match req {
            QaLogRequest::Ingest { channel, peer, .. } => {
                assert_eq!(channel, Channel::Backend);
                assert!(peer.is_none());
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }
}
