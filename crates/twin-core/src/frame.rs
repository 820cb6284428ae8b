use serde_json::{Map, Value};
use thiserror::Error;

const DEFAULT_EVENT_NAME: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame is not an event object: {0}")]
    Shape(String),
}

/// A named event received on a streaming subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub event: String,
    pub data: Value,
    pub ts: Option<i64>,
}

/// Parses one inbound text frame.
///
/// Accepts `{"event": name, "data": ..}` (also `type`/`payload`) or a
/// two-element `[name, data]` array. Frames have no size bound.
pub fn decode_stream_frame(text: &str) -> Result<StreamMessage, FrameError> {
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|err| FrameError::Decode(err.to_string()))?;
    match value {
        Value::Object(map) => Ok(message_from_object(map)),
        Value::Array(mut items) if items.len() == 2 && items[0].is_string() => {
            let data = items.pop().unwrap_or(Value::Null);
            let event = items
                .pop()
                .and_then(|name| name.as_str().map(str::to_string))
                .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string());
            Ok(StreamMessage {
                event,
                data,
                ts: None,
            })
        }
        other => Err(FrameError::Shape(kind_name(&other).to_string())),
    }
}

fn message_from_object(mut map: Map<String, Value>) -> StreamMessage {
    let event = ["event", "type", "name"]
        .iter()
        .find_map(|key| match map.get(*key) {
            Some(Value::String(name)) if !name.trim().is_empty() => Some(name.clone()),
            _ => None,
        })
        .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string());
    let ts = map.get("ts").and_then(Value::as_i64);
    let data = ["data", "payload"]
        .iter()
        .find_map(|key| map.remove(*key))
        .unwrap_or(Value::Object(map));
    StreamMessage { event, data, ts }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_frames_use_event_and_data() {
        let message =
            decode_stream_frame(r#"{"event":"actuator","data":{"id":1},"ts":99}"#).expect("decode");
        assert_eq!(message.event, "actuator");
        assert_eq!(message.data, json!({"id": 1}));
        assert_eq!(message.ts, Some(99));
    }

    #[test]
    fn type_payload_aliases_are_accepted() {
        let message =
            decode_stream_frame(r#"{"type":"vibration","payload":[1,2,3]}"#).expect("decode");
        assert_eq!(message.event, "vibration");
        assert_eq!(message.data, json!([1, 2, 3]));
    }

    #[test]
    fn bare_objects_become_message_events() {
        let message = decode_stream_frame(r#"{"id":3,"S1":1}"#).expect("decode");
        assert_eq!(message.event, "message");
        assert_eq!(message.data, json!({"id": 3, "S1": 1}));
    }

    #[test]
    fn array_frames_carry_name_and_data() {
        let message = decode_stream_frame(r#"["heartbeat", {"ok": true}]"#).expect("decode");
        assert_eq!(message.event, "heartbeat");
        assert_eq!(message.data, json!({"ok": true}));
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(
            decode_stream_frame("{not json"),
            Err(FrameError::Decode(_))
        ));
        assert!(matches!(
            decode_stream_frame("42"),
            Err(FrameError::Shape(_))
        ));
        assert!(matches!(
            decode_stream_frame(r#"[1, 2]"#),
            Err(FrameError::Shape(_))
        ));
    }
}
