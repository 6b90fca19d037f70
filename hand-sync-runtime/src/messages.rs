use serde::{self, Deserialize, Serialize};

use crate::schema::PoseFrame;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSessionMessage {
    pub command: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveSessionMessage {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseData {
    pub frame: PoseFrame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseSyncMessage {
    pub command: String,
    pub data: PoseData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMessage {
    pub event_type: String,
    pub sender_id: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseSyncEvent {
    pub event_type: String,
    pub sender_id: String,
    pub data: PoseData,
}

#[derive(Debug, Deserialize)]
#[serde(try_from = "MessageHelper")]
pub enum ServerMessage {
    Welcome(NetworkMessage),
    SessionMembers(NetworkMessage),
    PoseSync(PoseSyncEvent),
    ServerError(NetworkMessage),
}

// Peeks at event_type before picking the concrete payload
#[derive(Deserialize)]
struct MessageHelper {
    event_type: String,
    #[serde(flatten)]
    rest: serde_json::Value,
}

impl TryFrom<MessageHelper> for ServerMessage {
    type Error = String;

    fn try_from(helper: MessageHelper) -> Result<Self, String> {
        let mut json_map = serde_json::Map::new();
        json_map.insert("event_type".to_string(), helper.event_type.clone().into());

        if let serde_json::Value::Object(rest_map) = helper.rest {
            json_map.extend(rest_map);
        }

        let json = serde_json::Value::Object(json_map);
        let parsed = match helper.event_type.as_str() {
            "welcome" => serde_json::from_value(json).map(ServerMessage::Welcome),
            "session_members" => serde_json::from_value(json).map(ServerMessage::SessionMembers),
            "pose_sync" => serde_json::from_value(json).map(ServerMessage::PoseSync),
            "error" => serde_json::from_value(json).map(ServerMessage::ServerError),
            other => return Err(format!("unknown message type: {}", other)),
        };

        parsed.map_err(|e| e.to_string())
    }
}
