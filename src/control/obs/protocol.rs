//! obs-websocket 5.x message shapes.
//!
//! Every frame is `{ "op": <opcode>, "d": <payload> }`. Only the messages the controller
//! uses are modeled; anything else is read as a raw `serde_json::Value` and ignored.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::control::{Notification, SceneItem};
use crate::error::ControlPlaneError;

pub const RPC_VERSION: u32 = 1;

pub mod op {
    pub const HELLO: u8 = 0;
    pub const IDENTIFY: u8 = 1;
    pub const IDENTIFIED: u8 = 2;
    pub const EVENT: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const REQUEST_RESPONSE: u8 = 7;
    pub const REQUEST_BATCH: u8 = 8;
    pub const REQUEST_BATCH_RESPONSE: u8 = 9;
}

/// Event subscription bits.
pub mod subscription {
    /// Carries `ExitStarted`.
    pub const GENERAL: u32 = 1 << 0;
    pub const SCENES: u32 = 1 << 2;
    pub const INPUTS: u32 = 1 << 3;
    pub const OUTPUTS: u32 = 1 << 6;
    pub const SCENE_ITEMS: u32 = 1 << 7;

    pub const CONTROLLER: u32 = GENERAL | SCENES | INPUTS | OUTPUTS | SCENE_ITEMS;
}

/// WebSocket close code sent when Identify carries a bad credential.
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4009;

#[derive(Debug, Deserialize, Serialize)]
pub struct Envelope {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(default)]
    pub obs_web_socket_version: Option<String>,
    pub rpc_version: u32,
    #[serde(default)]
    pub authentication: Option<AuthChallenge>,
}

#[derive(Debug, Deserialize)]
pub struct AuthChallenge {
    pub challenge: String,
    pub salt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub rpc_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
    pub event_subscriptions: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<'a> {
    pub request_type: &'a str,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBatch<'a> {
    pub request_id: String,
    pub halt_on_failure: bool,
    pub requests: Vec<Request<'a>>,
}

#[derive(Debug, Deserialize)]
pub struct RequestStatus {
    pub result: bool,
    pub code: u16,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub request_type: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub request_status: RequestStatus,
    #[serde(default)]
    pub response_data: Option<Value>,
}

impl RequestResponse {
    /// Response payload, or the classified failure.
    pub fn into_result(self) -> Result<Value, ControlPlaneError> {
        if self.request_status.result {
            Ok(self.response_data.unwrap_or(Value::Null))
        } else {
            Err(ControlPlaneError::from_status(
                &self.request_type,
                self.request_status.code,
                self.request_status.comment,
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBatchResponse {
    pub request_id: String,
    #[serde(default)]
    pub results: Vec<RequestResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: String,
    #[serde(default)]
    pub event_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneListData {
    #[serde(default)]
    scenes: Vec<SceneEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneEntry {
    scene_name: String,
    #[serde(default)]
    scene_index: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneItemListData {
    #[serde(default)]
    scene_items: Vec<SceneItemEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneItemEntry {
    scene_item_id: i64,
    source_name: String,
    #[serde(default)]
    scene_item_enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputStatusData {
    output_active: bool,
}

/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
pub fn auth_response(password: &str, salt: &str, challenge: &str) -> String {
    let secret = STANDARD.encode(Sha256::digest(format!("{}{}", password, salt)));
    STANDARD.encode(Sha256::digest(format!("{}{}", secret, challenge)))
}

fn decode<T: for<'de> Deserialize<'de>>(request: &str, data: Value) -> Result<T, ControlPlaneError> {
    serde_json::from_value(data)
        .map_err(|e| ControlPlaneError::Protocol(format!("{} response: {}", request, e)))
}

/// Scene names in UI order (top first).
pub fn parse_scene_list(data: Value) -> Result<Vec<String>, ControlPlaneError> {
    let mut list: SceneListData = decode("GetSceneList", data)?;
    // obs-websocket reports the bottom scene as index 0.
    list.scenes.sort_by(|a, b| b.scene_index.cmp(&a.scene_index));
    Ok(list.scenes.into_iter().map(|s| s.scene_name).collect())
}

pub fn parse_scene_items(data: Value) -> Result<Vec<SceneItem>, ControlPlaneError> {
    let list: SceneItemListData = decode("GetSceneItemList", data)?;
    Ok(list
        .scene_items
        .into_iter()
        .map(|item| SceneItem {
            id: item.scene_item_id,
            source_name: item.source_name,
            enabled: item.scene_item_enabled,
        })
        .collect())
}

pub fn parse_output_active(request: &str, data: Value) -> Result<bool, ControlPlaneError> {
    let status: OutputStatusData = decode(request, data)?;
    Ok(status.output_active)
}

/// Map a pushed event to the notifications the controller cares about.
pub fn classify_event(event: &Event) -> Option<Notification> {
    let output_active = || {
        event
            .event_data
            .as_ref()
            .and_then(|d| d.get("outputActive"))
            .and_then(Value::as_bool)
    };
    match event.event_type.as_str() {
        "StreamStateChanged" => output_active().map(Notification::StreamingChanged),
        "RecordStateChanged" => output_active().map(Notification::RecordingChanged),
        "SceneCreated" | "SceneRemoved" | "SceneNameChanged" | "SceneItemCreated"
        | "SceneItemRemoved" | "InputNameChanged" | "InputRemoved" => {
            Some(Notification::TopologyChanged)
        }
        "ExitStarted" => Some(Notification::Closing),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_response_matches_reference_vector() {
        let auth = auth_response(
            "supersecretpassword",
            "lM1GncleQOaCu9lT1yeUZhFYnqhsLLP1G5lAGo3ixaI=",
            "+IxH4CnCiqpX1rM9scsNynZzbOe4KhDeYcTNS3PDaeY=",
        );
        assert_eq!(auth, "1Ct943GAT+6YQUUX47Ia/ncufilbe6+oD6lY+5kaCu4=");
    }

    #[test]
    fn parses_hello_with_challenge() {
        let env: Envelope = serde_json::from_str(
            r#"{"op":0,"d":{"obsWebSocketVersion":"5.5.2","rpcVersion":1,
                "authentication":{"challenge":"abc","salt":"xyz"}}}"#,
        )
        .unwrap();
        assert_eq!(env.op, op::HELLO);
        let hello: Hello = serde_json::from_value(env.d).unwrap();
        assert_eq!(hello.rpc_version, 1);
        assert_eq!(hello.authentication.unwrap().salt, "xyz");
    }

    #[test]
    fn identify_omits_missing_authentication() {
        let identify = Identify {
            rpc_version: RPC_VERSION,
            authentication: None,
            event_subscriptions: subscription::CONTROLLER,
        };
        let value = serde_json::to_value(identify).unwrap();
        assert_eq!(value, json!({"rpcVersion": 1, "eventSubscriptions": 205}));
    }

    #[test]
    fn scene_list_is_returned_top_first() {
        let scenes = parse_scene_list(json!({
            "currentProgramSceneName": "Main",
            "scenes": [
                {"sceneIndex": 0, "sceneName": "Detection"},
                {"sceneIndex": 1, "sceneName": "Break"},
                {"sceneIndex": 2, "sceneName": "Main"}
            ]
        }))
        .unwrap();
        assert_eq!(scenes, vec!["Main", "Break", "Detection"]);
    }

    #[test]
    fn failed_status_600_is_not_found() {
        let resp: RequestResponse = serde_json::from_value(json!({
            "requestType": "GetSceneItemList",
            "requestId": "7",
            "requestStatus": {"result": false, "code": 600, "comment": "No source was found"}
        }))
        .unwrap();
        assert!(resp.into_result().unwrap_err().is_not_found());
    }

    #[test]
    fn scene_items_parse_enabled_flags() {
        let items = parse_scene_items(json!({
            "sceneItems": [
                {"sceneItemId": 3, "sourceName": "Face Cam", "sceneItemEnabled": true},
                {"sceneItemId": 9, "sourceName": "Slate", "sceneItemEnabled": false}
            ]
        }))
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, 3);
        assert!(items[0].enabled);
        assert!(!items[1].enabled);
    }

    #[test]
    fn classifies_output_and_topology_events() {
        let stream: Event = serde_json::from_value(json!({
            "eventType": "StreamStateChanged",
            "eventIntent": 64,
            "eventData": {"outputActive": true, "outputState": "OBS_WEBSOCKET_OUTPUT_STARTED"}
        }))
        .unwrap();
        assert_eq!(
            classify_event(&stream),
            Some(Notification::StreamingChanged(true))
        );

        let removed: Event = serde_json::from_value(json!({
            "eventType": "SceneItemRemoved",
            "eventData": {"sceneName": "Main", "sourceName": "Face Cam", "sceneItemId": 3}
        }))
        .unwrap();
        assert_eq!(classify_event(&removed), Some(Notification::TopologyChanged));

        let other: Event = serde_json::from_value(json!({
            "eventType": "CurrentProgramSceneChanged",
            "eventData": {"sceneName": "Main"}
        }))
        .unwrap();
        assert_eq!(classify_event(&other), None);
    }

    #[test]
    fn exit_started_is_subscribed_and_closes() {
        assert_ne!(subscription::CONTROLLER & subscription::GENERAL, 0);
        let exit: Event = serde_json::from_value(json!({
            "eventType": "ExitStarted",
            "eventIntent": 1,
            "eventData": null
        }))
        .unwrap();
        assert_eq!(classify_event(&exit), Some(Notification::Closing));
    }
}
