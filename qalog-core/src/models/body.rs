use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request/response body as captured by a hook. Hooks send either a raw
/// string or an already-structured JSON value; both are stored as text and
/// parsed again only when read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Body {
    Text(String),
    Json(Value),
}

impl Body {
    pub fn to_stored(&self) -> String {
        match self {
            Body::Text(s) => s.clone(),
            Body::Json(v) => v.to_string(),
        }
    }

    /// Interpret stored text, promoting JSON objects and arrays back to
    /// structured values.
    pub fn from_stored(raw: &str) -> Self {
        let trimmed = raw.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(v) = serde_json::from_str::<Value>(raw) {
                return Body::Json(v);
            }
        }
        Body::Text(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_untagged_deserialize() {
        let text: Body = serde_json::from_value(json!("plain")).unwrap();
        assert_eq!(text, Body::Text("plain".to_string()));

        let obj: Body = serde_json::from_value(json!({"a": 1})).unwrap();
        assert_eq!(obj, Body::Json(json!({"a": 1})));
    }

    #[test]
    fn test_from_stored_promotes_json_only_when_valid() {
        assert_eq!(Body::from_stored("{\"ok\":true}"), Body::Json(json!({"ok": true})));
        assert_eq!(Body::from_stored("{broken"), Body::Text("{broken".to_string()));
        assert_eq!(Body::from_stored("42"), Body::Text("42".to_string()));
    }
}
