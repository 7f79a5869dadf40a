//! JSON-lines request surface: one request per stdin line, one reply per
//! stdout line, plus unprompted `update` lines for state changes.

use avlink::{DeviceHandle, LinkError, StateChange, Value};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Command {
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    StateSet {
        var: String,
        value: Value,
    },
    StateGet {
        var: String,
    },
}

pub async fn dispatch(handle: &DeviceHandle, request: Request) -> Result<Value, LinkError> {
    match request {
        Request::Command { method, args } => handle.enqueue_command(&method, args).await,
        Request::StateSet { var, value } => handle.state_set(&var, value).await,
        Request::StateGet { var } => handle.state_get(&var),
    }
}

/// Answer one input line. Malformed input still gets a reply, echoing the id
/// when one could be read.
pub async fn answer(handle: &DeviceHandle, line: &str) -> serde_json::Value {
    let raw: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return json!({ "id": null, "error": format!("invalid JSON: {e}") }),
    };
    let id = raw.get("id").cloned().unwrap_or(serde_json::Value::Null);
    let outcome = match serde_json::from_value::<Request>(raw) {
        Ok(request) => dispatch(handle, request).await.map_err(|e| e.to_string()),
        Err(e) => Err(format!("bad request: {e}")),
    };
    match outcome {
        Ok(result) => json!({ "id": id, "result": result }),
        Err(error) => json!({ "id": id, "error": error }),
    }
}

#[must_use]
pub fn update_line(change: &StateChange) -> serde_json::Value {
    json!({
        "update": true,
        "var": change.name,
        "now": change.new,
        "was": change.old,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use avlink::{devices, DeviceEngine, SerialSettings};
    use std::sync::Arc;

    fn handle() -> (DeviceEngine, DeviceHandle) {
        let protocol = devices::protocol_for("extron_video_switcher").expect("driver");
        DeviceEngine::new("test", Arc::new(protocol), &SerialSettings::default()).expect("engine")
    }

    #[test]
    fn parses_each_request_type() {
        let r: Request =
            serde_json::from_str(r#"{"id":1,"type":"command","method":"set_input","args":["2"]}"#)
                .expect("command");
        assert_eq!(
            r,
            Request::Command {
                method: "set_input".into(),
                args: vec![Value::from("2")],
            }
        );
        let r: Request = serde_json::from_str(r#"{"type":"state_set","var":"volume","value":0.5}"#)
            .expect("state_set");
        assert_eq!(
            r,
            Request::StateSet {
                var: "volume".into(),
                value: Value::Number(0.5),
            }
        );
        let r: Request =
            serde_json::from_str(r#"{"type":"state_get","var":"mute"}"#).expect("state_get");
        assert_eq!(r, Request::StateGet { var: "mute".into() });
    }

    #[tokio::test]
    async fn unknown_type_gets_error_reply_with_id() {
        let (_engine, h) = handle();
        let reply = answer(&h, r#"{"id":"a7","type":"reboot"}"#).await;
        assert_eq!(reply["id"], json!("a7"));
        assert!(reply["error"].as_str().is_some_and(|e| e.contains("bad request")));

        let reply = answer(&h, "not json").await;
        assert_eq!(reply["id"], serde_json::Value::Null);
        assert!(reply.get("error").is_some());
    }

    #[tokio::test]
    async fn state_get_and_read_only_set() {
        let (_engine, h) = handle();
        let reply = answer(&h, r#"{"id":2,"type":"state_get","var":"mute"}"#).await;
        assert_eq!(reply, json!({ "id": 2, "result": null }));

        let reply = answer(&h, r#"{"id":3,"type":"state_set","var":"clipping","value":true}"#).await;
        assert_eq!(reply["error"], json!("state variable clipping is not editable"));
    }

    #[test]
    fn update_line_shape() {
        let change = StateChange {
            name: "input".into(),
            old: Value::from("1"),
            new: Value::from("3"),
            version: 4,
        };
        assert_eq!(
            update_line(&change),
            json!({ "update": true, "var": "input", "now": "3", "was": "1" })
        );
    }
}
