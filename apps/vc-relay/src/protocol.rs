use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// WebSocket close codes used by the relay.
pub const CLOSE_NORMAL: u16 = 1000;
/// Policy violation: bad room code, unknown room, bad identity code,
/// duplicate data source.
pub const CLOSE_POLICY: u16 = 1008;
/// The data source (or the room owner) went away and the room tore down
/// underneath this connection.
pub const CLOSE_HOST_GONE: u16 = 1012;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("snapshot payload is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("unsupported message purpose: {0}")]
    UnknownPurpose(String),
}

// ---------------------------------------------------------------------------
// Data-source command envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RequestHeader {
    pub version: u32,
    #[serde(rename = "requestId")]
    pub request_id: Uuid,
    #[serde(rename = "messagePurpose")]
    pub message_purpose: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandOrigin {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandRequestBody {
    pub version: u32,
    #[serde(rename = "commandLine")]
    pub command_line: String,
    pub origin: CommandOrigin,
}

/// Outbound command invocation, one JSON object per frame.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRequest {
    pub header: RequestHeader,
    pub body: CommandRequestBody,
}

impl CommandRequest {
    pub fn new(command_line: &str) -> (Uuid, Self) {
        let request_id = Uuid::new_v4();
        let request = Self {
            header: RequestHeader {
                version: 1,
                request_id,
                message_purpose: "commandRequest",
            },
            body: CommandRequestBody {
                version: 1,
                command_line: command_line.to_string(),
                origin: CommandOrigin { kind: "player" },
            },
        };
        (request_id, request)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeBody {
    #[serde(rename = "eventName")]
    pub event_name: &'static str,
}

/// Event-subscription envelope sent once after the data source attaches.
/// Fire-and-forget: no response is correlated back.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest {
    pub header: RequestHeader,
    pub body: SubscribeBody,
}

impl SubscribeRequest {
    pub fn command_responses() -> Self {
        Self {
            header: RequestHeader {
                version: 1,
                request_id: Uuid::new_v4(),
                message_purpose: "subscribe",
            },
            body: SubscribeBody {
                event_name: "CommandResponse",
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct InboundHeader {
    #[serde(rename = "messagePurpose")]
    message_purpose: String,
    #[serde(rename = "requestId")]
    request_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseBody {
    #[serde(rename = "statusCode", default)]
    status_code: i32,
    #[serde(rename = "statusMessage", default)]
    status_message: String,
}

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    header: InboundHeader,
    #[serde(default)]
    body: Option<ResponseBody>,
}

/// Every message the data source can send us, keyed on the header's
/// `messagePurpose` discriminant. Purposes we do not speak are rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSourceMessage {
    CommandResponse {
        request_id: Uuid,
        status_code: i32,
        status_message: String,
    },
}

pub fn parse_data_source_message(text: &str) -> Result<DataSourceMessage, ProtocolError> {
    let envelope: InboundEnvelope = serde_json::from_str(text)?;
    match envelope.header.message_purpose.as_str() {
        "commandResponse" => {
            let request_id = envelope.header.request_id.ok_or_else(|| {
                ProtocolError::UnknownPurpose("commandResponse without requestId".to_string())
            })?;
            let body = envelope.body.unwrap_or_default();
            Ok(DataSourceMessage::CommandResponse {
                request_id,
                status_code: body.status_code,
                status_message: body.status_message,
            })
        }
        other => Err(ProtocolError::UnknownPurpose(other.to_string())),
    }
}

/// `getlocalplayername` responses come back either as a JSON object with a
/// `localplayername` field or as the bare name string.
pub fn parse_local_player_name(status_message: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(status_message) {
        for key in ["localplayername", "localPlayerName"] {
            if let Some(name) = value.get(key).and_then(|v| v.as_str()) {
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        }
    }
    let trimmed = status_message.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// ---------------------------------------------------------------------------
// Sync snapshot
// ---------------------------------------------------------------------------

/// Compact envelope returned by `vcserver:sync`: a sequence number and a
/// base64-encoded JSON snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub s: i64,
    pub d: String,
}

impl SyncMessage {
    pub fn parse(status_message: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(status_message)?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GroupKind {
    #[serde(rename = "n")]
    Normal,
    #[serde(rename = "i")]
    Isolated,
    #[serde(rename = "o")]
    Open,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupEntry {
    pub t: GroupKind,
    pub n: String,
    pub p: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSettings {
    pub voice_range: f64,
    pub can_hear_spectator: bool,
}

/// Per-entity data: position, rotation, group indices. Serialized as a
/// three-element array; `pd[i]` describes `pl[i]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityData(pub [f64; 3], pub [f64; 2], pub Vec<u32>);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    #[serde(default)]
    pub g: Vec<GroupEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pl: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<VoiceSettings>,
    #[serde(default)]
    pub pd: Vec<EntityData>,
}

impl Snapshot {
    pub fn decode(payload: &str) -> Result<Self, ProtocolError> {
        let raw = BASE64.decode(payload)?;
        let json = String::from_utf8(raw)?;
        Ok(serde_json::from_str(&json)?)
    }
}

// ---------------------------------------------------------------------------
// Front-end relay frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerJoinData {
    pub player_name: String,
    pub player_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerNameData {
    pub player_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponseData {
    pub player_name: String,
    pub room_id: String,
}

/// Messages sent from the relay to a browser connection (owner or peer).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayMessage {
    PlayerJoin { data: PlayerJoinData },
    PlayerLeave { data: PlayerNameData },
    PeerDisconnect { data: PlayerNameData },
    Signal {
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        payload: serde_json::Value,
    },
    JoinResponse { data: JoinResponseData },
    Sync { data: String },
}

/// Messages a browser connection sends to the relay. Unknown `type` tags
/// fail deserialization and are dropped with a warning.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    Signal {
        target: String,
        payload: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_request_envelope_shape() {
        let (request_id, request) = CommandRequest::new("vcserver:sync true");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "header": {
                    "version": 1,
                    "requestId": request_id.to_string(),
                    "messagePurpose": "commandRequest",
                },
                "body": {
                    "version": 1,
                    "commandLine": "vcserver:sync true",
                    "origin": { "type": "player" },
                },
            })
        );
    }

    #[test]
    fn test_subscribe_envelope_shape() {
        let value = serde_json::to_value(SubscribeRequest::command_responses()).unwrap();
        assert_eq!(value["header"]["messagePurpose"], "subscribe");
        assert_eq!(value["body"]["eventName"], "CommandResponse");
    }

    #[test]
    fn test_parse_command_response() {
        let request_id = Uuid::new_v4();
        let text = json!({
            "header": { "messagePurpose": "commandResponse", "requestId": request_id },
            "body": { "statusCode": 0, "statusMessage": "ok" },
        })
        .to_string();
        let message = parse_data_source_message(&text).unwrap();
        assert_eq!(
            message,
            DataSourceMessage::CommandResponse {
                request_id,
                status_code: 0,
                status_message: "ok".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_purpose_is_rejected() {
        let text = json!({
            "header": { "messagePurpose": "event", "requestId": Uuid::new_v4() },
            "body": { "eventName": "PlayerMessage" },
        })
        .to_string();
        assert!(matches!(
            parse_data_source_message(&text),
            Err(ProtocolError::UnknownPurpose(purpose)) if purpose == "event"
        ));
    }

    #[test]
    fn test_parse_local_player_name_variants() {
        assert_eq!(
            parse_local_player_name(r#"{"localplayername":"Alice"}"#),
            Some("Alice".to_string())
        );
        assert_eq!(
            parse_local_player_name(r#"{"localPlayerName":"Alice"}"#),
            Some("Alice".to_string())
        );
        assert_eq!(parse_local_player_name("  Alice  "), Some("Alice".to_string()));
        assert_eq!(parse_local_player_name(""), None);
    }

    #[test]
    fn test_snapshot_decode() {
        let snapshot = json!({
            "g": [{ "t": "n", "n": "miners", "p": "secret" }],
            "pl": ["Alice", "Bob"],
            "s": { "voiceRange": 24.0, "canHearSpectator": false },
            "pd": [
                [[0.5, 100.0, -3.2], [0.0, 90.0], [0]],
                [[5.0, 100.0, 5.0], [10.0, 180.0], []],
            ],
        });
        let payload = BASE64.encode(snapshot.to_string());

        let decoded = Snapshot::decode(&payload).unwrap();
        assert_eq!(decoded.pl.as_deref(), Some(&["Alice".to_string(), "Bob".to_string()][..]));
        assert_eq!(decoded.g[0].t, GroupKind::Normal);
        assert_eq!(decoded.g[0].n, "miners");
        assert_eq!(decoded.s.as_ref().unwrap().voice_range, 24.0);
        assert_eq!(decoded.pd[0].0, [0.5, 100.0, -3.2]);
        assert_eq!(decoded.pd[0].1, [0.0, 90.0]);
        assert_eq!(decoded.pd[0].2, vec![0]);
    }

    #[test]
    fn test_snapshot_decode_delta_without_roster() {
        let payload = BASE64.encode(json!({ "g": [], "pd": [] }).to_string());
        let decoded = Snapshot::decode(&payload).unwrap();
        assert!(decoded.pl.is_none());
        assert!(decoded.s.is_none());
    }

    #[test]
    fn test_snapshot_decode_rejects_garbage() {
        assert!(Snapshot::decode("not base64!!!").is_err());
        let payload = BASE64.encode("not json");
        assert!(Snapshot::decode(&payload).is_err());
    }

    #[test]
    fn test_relay_frame_wire_shapes() {
        let join = RelayMessage::PlayerJoin {
            data: PlayerJoinData {
                player_name: "Bob".to_string(),
                player_code: "QRST".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&join).unwrap(),
            json!({ "type": "playerJoin", "data": { "playerName": "Bob", "playerCode": "QRST" } })
        );

        let leave = RelayMessage::PlayerLeave {
            data: PlayerNameData {
                player_name: "Bob".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&leave).unwrap(),
            json!({ "type": "playerLeave", "data": { "playerName": "Bob" } })
        );

        let disconnect = RelayMessage::PeerDisconnect {
            data: PlayerNameData {
                player_name: "Bob".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&disconnect).unwrap(),
            json!({ "type": "peerDisconnect", "data": { "playerName": "Bob" } })
        );

        let signal = RelayMessage::Signal {
            target: Some("owner".to_string()),
            sender: Some("QRST".to_string()),
            payload: json!({ "candidate": {} }),
        };
        assert_eq!(
            serde_json::to_value(&signal).unwrap(),
            json!({ "type": "signal", "target": "owner", "sender": "QRST", "payload": { "candidate": {} } })
        );

        let response = RelayMessage::JoinResponse {
            data: JoinResponseData {
                player_name: "Bob".to_string(),
                room_id: "ABCDE".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "type": "joinResponse", "data": { "playerName": "Bob", "roomId": "ABCDE" } })
        );

        let sync = RelayMessage::Sync {
            data: "c29tZSBkYXRh".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&sync).unwrap(),
            json!({ "type": "sync", "data": "c29tZSBkYXRh" })
        );
    }

    #[test]
    fn test_client_frame_parsing() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "signal",
            "target": "owner",
            "payload": { "sdp": "v=0", "type": "offer" },
        }))
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::Signal {
                target: "owner".to_string(),
                payload: json!({ "sdp": "v=0", "type": "offer" }),
            }
        );

        assert!(serde_json::from_value::<ClientFrame>(json!({
            "type": "teleport",
            "target": "owner",
        }))
        .is_err());
    }
}
