use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A turtle is reported offline once its heartbeat is older than this.
pub const OFFLINE_AFTER_MS: f64 = 5000.0;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3300/api";

/// One turtle as reported by `GET /turtle/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turtle {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pos: Position,
    #[serde(default)]
    pub fuel: Fuel,
    #[serde(default, deserialize_with = "lua_list")]
    pub inventory: Vec<Option<InventoryItem>>,
    #[serde(default)]
    pub selected_slot: u32,
    #[serde(default)]
    pub sight: Sight,
    #[serde(default)]
    pub cmd_result: Value,
    #[serde(default, deserialize_with = "lua_list")]
    pub cmd_queue: Vec<String>,
    #[serde(default)]
    pub misc: Map<String, Value>,
    #[serde(default)]
    pub heartbeat: f64,
}

impl Turtle {
    pub fn is_offline(&self, now_ms: i64) -> bool {
        is_offline(self.heartbeat, now_ms)
    }

    /// Success flag and opaque value of the last executed command.
    ///
    /// The backend reports `[success, value]`; anything else means no command
    /// has run yet.
    pub fn command_result(&self) -> Option<(bool, &Value)> {
        match self.cmd_result.as_array()?.as_slice() {
            [Value::Bool(ok)] => Some((*ok, &NULL)),
            [Value::Bool(ok), value, ..] => Some((*ok, value)),
            _ => None,
        }
    }
}

static NULL: Value = Value::Null;

pub fn is_offline(heartbeat_secs: f64, now_ms: i64) -> bool {
    now_ms as f64 - heartbeat_secs * 1000.0 > OFFLINE_AFTER_MS
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
    pub z: i64,
    /// Facing as a quarter-turn index.
    #[serde(default)]
    pub r: i64,
    #[serde(default)]
    pub rname: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Fuel {
    pub current: i64,
    pub max: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuelLevel {
    Good,
    Moderate,
    Low,
}

impl Fuel {
    pub fn percentage(&self) -> f64 {
        if self.max <= 0 {
            return 0.0;
        }
        self.current as f64 / self.max as f64 * 100.0
    }

    pub fn level(&self) -> FuelLevel {
        let pct = self.percentage();
        if pct > 70.0 {
            FuelLevel::Good
        } else if pct > 30.0 {
            FuelLevel::Moderate
        } else {
            FuelLevel::Low
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item_groups: Vec<ItemGroup>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemGroup {
    pub id: String,
    pub display_name: String,
}

/// Block descriptors above, in front of and below the turtle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sight {
    #[serde(default)]
    pub up: Value,
    #[serde(default)]
    pub front: Value,
    #[serde(default)]
    pub down: Value,
}

// Lua serializes an empty table as `{}`, so lists may arrive as empty objects.
fn lua_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        other => serde_json::from_value(other).map_err(serde::de::Error::custom),
    }
}

/// What gets posted to `POST /turtle/{id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandInput {
    Single(String),
    Batch(Vec<String>),
    LuaScript(String),
}

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

impl CommandInput {
    pub fn is_lua_script(&self) -> bool {
        matches!(self, Self::LuaScript(_))
    }

    /// The command as shown in the debug panel: a string or a list of strings.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Single(s) | Self::LuaScript(s) => Value::String(s.clone()),
            Self::Batch(cmds) => Value::from(cmds.clone()),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::LuaScript(_) => CONTENT_TYPE_TEXT,
            Self::Single(_) | Self::Batch(_) => CONTENT_TYPE_JSON,
        }
    }

    /// Request body: a JSON array of commands, or the raw script text.
    pub fn body(&self) -> String {
        match self {
            Self::LuaScript(script) => script.clone(),
            Self::Single(cmd) => Value::from(vec![cmd.as_str()]).to_string(),
            Self::Batch(cmds) => Value::from(cmds.clone()).to_string(),
        }
    }

    pub fn request_info(&self) -> RequestInfo {
        RequestInfo {
            method: "POST".to_string(),
            headers: BTreeMap::from([("Content-Type".to_string(), self.content_type().to_string())]),
            body: Some(self.body()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl RequestInfo {
    pub fn get_json() -> Self {
        Self {
            method: "GET".to_string(),
            headers: BTreeMap::from([("Accept".to_string(), CONTENT_TYPE_JSON.to_string())]),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Low-level failure code, e.g. `ConnectionRefused`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Outcome of one fetch or command, kept for the debug panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    pub timestamp: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,
    #[serde(default)]
    pub is_lua_script: bool,
    pub request_info: RequestInfo,
}

impl ResponseEnvelope {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeVariant {
    Default,
    Destructive,
}

/// One-shot message meant for a toast in the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub variant: NoticeVariant,
}

impl Notice {
    pub fn destructive(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            variant: NoticeVariant::Destructive,
        }
    }
}
