use std::fmt;

use mac_address::MacAddress;
use serde_derive::{Deserialize, Serialize};

/// What observers see for a tracked entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Home,
    NotHome,
    Unavailable,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Home => "home",
            Presence::NotHome => "not_home",
            Presence::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Client,
    Device,
}

/// Stable unique id of a tracked entity, `{site}-{mac}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(site: &str, mac: &MacAddress) -> Self {
        EntityId(format!("{}-{}", site, format_mac(mac)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        EntityId(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, colon separated; the controller's own rendering.
pub fn format_mac(mac: &MacAddress) -> String {
    mac.bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ClientPayload {
    pub mac: Option<String>,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub essid: Option<String>,
    pub is_wired: Option<bool>,
    /// Unix seconds, integer or float.
    pub last_seen: Option<f64>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct DevicePayload {
    pub mac: Option<String>,
    pub name: Option<String>,
    pub model: Option<String>,
    pub ip: Option<String>,
    pub state: Option<i64>,
    /// Seconds until the device's next expected report.
    pub next_interval: Option<u64>,
    pub disabled: Option<bool>,
    pub last_seen: Option<f64>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct EventPayload {
    pub key: Option<String>,
    pub user: Option<String>,
    pub client: Option<String>,
    pub guest: Option<String>,
    pub ssid: Option<String>,
    pub hostname: Option<String>,
    /// Unix milliseconds.
    pub time: Option<i64>,
}

/// Controller websocket messages may carry one object or a list of them.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ControllerMessage {
    Client(OneOrMany<ClientPayload>),
    Device(OneOrMany<DevicePayload>),
    Event(OneOrMany<EventPayload>),
    ClientRemoved(OneOrMany<ClientPayload>),
    ControllerState(bool),
}

/// Data available when the controller session first comes up.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Snapshot {
    pub clients: Vec<ClientPayload>,
    pub devices: Vec<DevicePayload>,
    /// Every client the controller has ever seen, used for restoring.
    pub clients_all: Vec<ClientPayload>,
}
