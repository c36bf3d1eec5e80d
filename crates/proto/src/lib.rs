//! Cluster wire protocol
//!
//! Routing paths, handshake headers, status codes and the JSON message bodies
//! exchanged between the broker, shard agents and callers. Every message is a
//! single WebSocket text frame holding one JSON object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Header carrying the shared secret
pub const SECRET_KEY_HEADER: &str = "Secret-Key";

/// Header carrying the route key of the targeted shard
pub const SHARD_ID_HEADER: &str = "Shard-ID";

/// Header carrying the correlation id on response delivery
pub const UUID_HEADER: &str = "UUID";

/// Routing path selecting the broker handler for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    InitializeShard,
    DisconnectShard,
    CreateRequest,
    ReturnResponse,
}

impl Route {
    pub const ALL: [Route; 4] = [
        Route::InitializeShard,
        Route::DisconnectShard,
        Route::CreateRequest,
        Route::ReturnResponse,
    ];

    /// Resolve a request path such as `/create_request`
    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|route| route.path() == path)
    }

    pub fn path(&self) -> &'static str {
        match self {
            Route::InitializeShard => "/initialize_shard",
            Route::DisconnectShard => "/disconnect_shard",
            Route::CreateRequest => "/create_request",
            Route::ReturnResponse => "/return_response",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Identifier a shard registers under and callers target.
///
/// Integer and string identifiers share one namespace since the key travels
/// as a header value: `RouteKey::from(1)` and `RouteKey::from("1")` are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RouteKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&String> for RouteKey {
    fn from(value: &String) -> Self {
        Self(value.clone())
    }
}

macro_rules! route_key_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for RouteKey {
                fn from(value: $ty) -> Self {
                    Self(value.to_string())
                }
            }
        )*
    };
}

route_key_from_int!(u8, u16, u32, u64, usize, i32, i64);

/// Closed set of status codes used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum StatusCode {
    Ok,
    Unauthorized,
    Forbidden,
    NotFound,
    InternalError,
}

impl StatusCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::InternalError => 500,
        }
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> Self {
        code.as_u16()
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            200 => Ok(StatusCode::Ok),
            401 => Ok(StatusCode::Unauthorized),
            403 => Ok(StatusCode::Forbidden),
            404 => Ok(StatusCode::NotFound),
            500 => Ok(StatusCode::InternalError),
            other => Err(format!("unknown status code {}", other)),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Metadata presented once, in the upgrade request, for a connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMeta {
    /// Raw request path
    pub path: String,

    /// Shared secret, if the peer presented one
    pub secret_key: Option<String>,

    /// Route key for the shard-facing paths
    pub shard_id: Option<RouteKey>,

    /// Correlation id for response delivery
    pub uuid: Option<String>,
}

impl ConnectionMeta {
    /// Build from a request path and a header lookup.
    ///
    /// Empty header values are treated as absent.
    pub fn from_headers<F>(path: impl Into<String>, header: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |name: &str| header(name).filter(|value| !value.is_empty());

        Self {
            path: path.into(),
            secret_key: present(SECRET_KEY_HEADER),
            shard_id: present(SHARD_ID_HEADER).map(RouteKey::from),
            uuid: present(UUID_HEADER),
        }
    }

    pub fn route(&self) -> Option<Route> {
        Route::from_path(&self.path)
    }
}

/// Body sent by a shard on `/initialize_shard`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterShard {
    #[serde(default)]
    pub endpoints: Vec<String>,

    #[serde(default)]
    pub client_id: Option<u64>,
}

/// Body sent by a caller on `/create_request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub endpoint: String,

    #[serde(default)]
    pub kwargs: Option<Map<String, Value>>,
}

/// Request forwarded from the broker to a shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedRequest {
    pub endpoint: String,

    #[serde(default)]
    pub data: Map<String, Value>,

    pub uuid: String,
}

/// Acknowledgment or error status sent by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub code: StatusCode,
}

impl Ack {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            error: None,
            code: StatusCode::Ok,
        }
    }

    pub fn error(error: impl Into<String>, code: StatusCode) -> Self {
        Self {
            message: None,
            error: Some(error.into()),
            code,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Human readable text, whichever field is set
    pub fn text(&self) -> &str {
        self.error
            .as_deref()
            .or(self.message.as_deref())
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"error": "unencodable status", "code": {}}}"#, self.code)
        })
    }
}
