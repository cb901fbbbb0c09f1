//! Wire protocol.
//!
//! Every message is one JSON object carrying an integer `type` tag:
//!
//! | tag | direction | message |
//! |-----|-----------|---------|
//! | 1 | client -> server | join request |
//! | 2 | server -> client | join response |
//! | 3 | client -> server | player input |
//! | 4 | server -> client | game state |
//! | 5 | client -> server | jump |
//! | 6 | client -> server | spawn dummies |
//! | 7 | client -> server | delete all dummies |
//!
//! Decoding is lenient about extra fields and strict about the tag.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::math::{Color, Vec3};

pub const JOIN_REQUEST: i64 = 1;
pub const JOIN_RESPONSE: i64 = 2;
pub const PLAYER_INPUT: i64 = 3;
pub const GAME_STATE: i64 = 4;
pub const JUMP_COMMAND: i64 = 5;
pub const SPAWN_DUMMIES: i64 = 6;
pub const DELETE_ALL_DUMMIES: i64 = 7;

/// Nickname used when a join request omits one.
pub const DEFAULT_NICKNAME: &str = "Player";

/// Longer nicknames are truncated on decode.
pub const MAX_NICKNAME_CHARS: usize = 32;

/// Errors produced while decoding an inbound message.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no integer `type` field")]
    MissingType,

    #[error("unknown message type {0}")]
    UnknownType(i64),

    #[error("non-finite value in `{0}`")]
    NonFinite(&'static str),
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    JoinRequest {
        nickname: String,
        color: Option<Color>,
    },
    /// `player_id` is whatever the client claims; the server checks it.
    PlayerInput { player_id: i64, movement: Vec3 },
    Jump { player_id: i64 },
    SpawnDummies { count: Option<i64> },
    DeleteAllDummies,
}

impl ClientMsg {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMsg::JoinRequest { .. } => "join",
            ClientMsg::PlayerInput { .. } => "input",
            ClientMsg::Jump { .. } => "jump",
            ClientMsg::SpawnDummies { .. } => "spawn_dummies",
            ClientMsg::DeleteAllDummies => "delete_all_dummies",
        }
    }
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMsg {
    JoinResponse(JoinResponse),
    GameState(GameState),
}

/// Reply to a join request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JoinResponse {
    pub fn accepted(player_id: u32, nickname: impl Into<String>) -> Self {
        Self {
            success: true,
            player_id: Some(player_id),
            nickname: Some(nickname.into()),
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            player_id: None,
            nickname: None,
            message: Some(message.into()),
        }
    }
}

/// Full world snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GameState {
    pub players: Vec<PlayerState>,
    pub dummies: Vec<DummyState>,
}

impl GameState {
    pub fn player(&self, id: u32) -> Option<&PlayerState> {
        self.players.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub id: u32,
    pub nickname: String,
    pub pos: [f32; 3],
    pub vel: [f32; 3],
    pub color: [f32; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DummyState {
    pub id: u64,
    pub pos: [f32; 3],
}

#[derive(Serialize)]
struct Tagged<'a, T> {
    #[serde(rename = "type")]
    ty: i64,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Deserialize)]
struct RawJoin {
    #[serde(default = "default_nickname")]
    nickname: String,
    #[serde(default)]
    color: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInput {
    player_id: i64,
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJump {
    player_id: i64,
}

#[derive(Deserialize)]
struct RawSpawn {
    #[serde(default)]
    count: Option<i64>,
}

fn default_nickname() -> String {
    DEFAULT_NICKNAME.to_string()
}

/// Accepts `[r, g, b, ...]`; anything else is treated as "no color".
fn parse_color(v: &Value) -> Option<Color> {
    let arr = v.as_array()?;
    if arr.len() < 3 {
        return None;
    }
    // `1e39` is a valid f64 but overflows to infinity as f32.
    let c = |i: usize| {
        arr[i]
            .as_f64()
            .map(|f| f as f32)
            .filter(|f| f.is_finite())
    };
    Some(Color::new(c(0)?, c(1)?, c(2)?))
}

fn truncate_nickname(mut nickname: String) -> String {
    if let Some((at, _)) = nickname.char_indices().nth(MAX_NICKNAME_CHARS) {
        nickname.truncate(at);
    }
    nickname
}

fn split_tag(b: &[u8]) -> Result<(i64, Value), ProtocolError> {
    let value: Value = serde_json::from_slice(b)?;
    let ty = value
        .get("type")
        .and_then(Value::as_i64)
        .ok_or(ProtocolError::MissingType)?;
    Ok((ty, value))
}

fn body<T: DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    Ok(serde_json::from_value(value)?)
}

/// Decodes a client -> server message.
pub fn decode_client(b: &[u8]) -> Result<ClientMsg, ProtocolError> {
    let (ty, value) = split_tag(b)?;
    let msg = match ty {
        JOIN_REQUEST => {
            let raw: RawJoin = body(value)?;
            ClientMsg::JoinRequest {
                nickname: truncate_nickname(raw.nickname),
                color: raw.color.as_ref().and_then(parse_color),
            }
        }
        PLAYER_INPUT => {
            let raw: RawInput = body(value)?;
            let movement = Vec3::new(raw.x, raw.y, raw.z);
            if !movement.is_finite() {
                return Err(ProtocolError::NonFinite("player input"));
            }
            ClientMsg::PlayerInput {
                player_id: raw.player_id,
                movement,
            }
        }
        JUMP_COMMAND => {
            let raw: RawJump = body(value)?;
            ClientMsg::Jump {
                player_id: raw.player_id,
            }
        }
        SPAWN_DUMMIES => {
            let raw: RawSpawn = body(value)?;
            ClientMsg::SpawnDummies { count: raw.count }
        }
        DELETE_ALL_DUMMIES => ClientMsg::DeleteAllDummies,
        other => return Err(ProtocolError::UnknownType(other)),
    };
    Ok(msg)
}

/// Encodes a client -> server message.
pub fn encode_client(msg: &ClientMsg) -> Bytes {
    let value = match msg {
        ClientMsg::JoinRequest { nickname, color } => {
            let mut v = json!({ "type": JOIN_REQUEST, "nickname": nickname });
            if let Some(c) = color {
                v["color"] = json!(c.to_array());
            }
            v
        }
        ClientMsg::PlayerInput {
            player_id,
            movement,
        } => json!({
            "type": PLAYER_INPUT,
            "playerId": player_id,
            "x": movement.x,
            "y": movement.y,
            "z": movement.z,
        }),
        ClientMsg::Jump { player_id } => json!({ "type": JUMP_COMMAND, "playerId": player_id }),
        ClientMsg::SpawnDummies { count } => match count {
            Some(n) => json!({ "type": SPAWN_DUMMIES, "count": n }),
            None => json!({ "type": SPAWN_DUMMIES }),
        },
        ClientMsg::DeleteAllDummies => json!({ "type": DELETE_ALL_DUMMIES }),
    };
    Bytes::from(value.to_string())
}

/// Decodes a server -> client message.
pub fn decode_server(b: &[u8]) -> Result<ServerMsg, ProtocolError> {
    let (ty, value) = split_tag(b)?;
    match ty {
        JOIN_RESPONSE => Ok(ServerMsg::JoinResponse(body(value)?)),
        GAME_STATE => Ok(ServerMsg::GameState(body(value)?)),
        other => Err(ProtocolError::UnknownType(other)),
    }
}

/// Encodes a server -> client message.
pub fn encode_server(msg: &ServerMsg) -> serde_json::Result<Bytes> {
    let payload = match msg {
        ServerMsg::JoinResponse(r) => serde_json::to_vec(&Tagged {
            ty: JOIN_RESPONSE,
            body: r,
        })?,
        ServerMsg::GameState(s) => serde_json::to_vec(&Tagged {
            ty: GAME_STATE,
            body: s,
        })?,
    };
    Ok(Bytes::from(payload))
}
