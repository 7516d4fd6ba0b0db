//! Converts raw controller payloads into the canonical records the tracker
//! works with. Nothing in here fails: payloads without a usable MAC are
//! dropped and every other missing field simply stays unknown.

use std::time::Duration;

use log::debug;
use mac_address::MacAddress;

use crate::clock::Timestamp;
use crate::messages::{ClientPayload, DevicePayload, EventPayload};

/// Device `state` value the controller uses for an adopted, connected device.
pub const DEVICE_STATE_CONNECTED: i64 = 1;

/// Reporting cadence assumed when a device does not announce `next_interval`.
pub const DEFAULT_NEXT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Poll,
    EventConnect,
    EventDisconnect,
}

/// One normalized observation of a client.
#[derive(Clone, Debug, PartialEq)]
pub struct RawSignal {
    pub mac: MacAddress,
    pub timestamp: Option<Timestamp>,
    pub wired: Option<bool>,
    pub ssid: Option<String>,
    pub origin: Origin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKey {
    WirelessConnected,
    WirelessDisconnected,
    WirelessRoam,
    WirelessRoamRadio,
    WiredConnected,
    WiredDisconnected,
}

impl EventKey {
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "EVT_WU_Connected" => Some(EventKey::WirelessConnected),
            "EVT_WU_Disconnected" => Some(EventKey::WirelessDisconnected),
            "EVT_WU_Roam" => Some(EventKey::WirelessRoam),
            "EVT_WU_RoamRadio" => Some(EventKey::WirelessRoamRadio),
            "EVT_LU_Connected" => Some(EventKey::WiredConnected),
            "EVT_LU_Disconnected" => Some(EventKey::WiredDisconnected),
            _ => None,
        }
    }

    pub fn origin(&self) -> Origin {
        match self {
            EventKey::WirelessConnected
            | EventKey::WirelessRoam
            | EventKey::WirelessRoamRadio
            | EventKey::WiredConnected => Origin::EventConnect,
            EventKey::WirelessDisconnected | EventKey::WiredDisconnected => Origin::EventDisconnect,
        }
    }

    pub fn is_wired(&self) -> bool {
        matches!(self, EventKey::WiredConnected | EventKey::WiredDisconnected)
    }
}

/// Latest known data for a client, kept even while no entity exists for it
/// so the policy gate can recreate the entity later.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientRecord {
    pub mac: MacAddress,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub essid: Option<String>,
    pub is_wired: Option<bool>,
    pub last_seen: Option<Timestamp>,
}

impl ClientRecord {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.hostname.clone())
            .unwrap_or_else(|| crate::messages::format_mac(&self.mac))
    }

    /// Merge a newer report into the remembered record. Static attributes are
    /// replaced when present; `last_seen` never moves backward.
    pub fn absorb(&mut self, update: ClientRecord) {
        if update.name.is_some() {
            self.name = update.name;
        }
        if update.hostname.is_some() {
            self.hostname = update.hostname;
        }
        if update.ip.is_some() {
            self.ip = update.ip;
        }
        if update.essid.is_some() {
            self.essid = update.essid;
        }
        if update.is_wired.is_some() {
            self.is_wired = update.is_wired;
        }
        self.last_seen = match (self.last_seen, update.last_seen) {
            (Some(current), Some(new)) => Some(current.max(new)),
            (current, new) => current.or(new),
        };
    }

    pub fn poll_signal(&self) -> RawSignal {
        RawSignal {
            mac: self.mac,
            timestamp: self.last_seen,
            wired: self.is_wired,
            ssid: self.essid.clone(),
            origin: Origin::Poll,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceRecord {
    pub mac: MacAddress,
    pub name: Option<String>,
    pub model: Option<String>,
    pub ip: Option<String>,
    pub state: Option<i64>,
    pub next_interval: Duration,
    pub disabled: bool,
    pub last_seen: Option<Timestamp>,
}

impl DeviceRecord {
    pub fn is_connected(&self) -> bool {
        self.state == Some(DEVICE_STATE_CONNECTED)
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.model.clone())
            .unwrap_or_else(|| crate::messages::format_mac(&self.mac))
    }
}

fn parse_mac(raw: Option<&str>) -> Option<MacAddress> {
    let raw = raw?;
    match raw.parse::<MacAddress>() {
        Ok(mac) => Some(mac),
        Err(err) => {
            debug!("Dropping payload with unparsable MAC {:?}: {}", raw, err);
            None
        }
    }
}

pub fn client(payload: ClientPayload) -> Option<ClientRecord> {
    let mac = parse_mac(payload.mac.as_deref())?;
    Some(ClientRecord {
        mac,
        name: payload.name,
        hostname: payload.hostname,
        ip: payload.ip,
        essid: payload.essid,
        is_wired: payload.is_wired,
        last_seen: payload.last_seen.and_then(Timestamp::from_secs_f64),
    })
}

pub fn device(payload: DevicePayload) -> Option<DeviceRecord> {
    let mac = parse_mac(payload.mac.as_deref())?;
    Some(DeviceRecord {
        mac,
        name: payload.name,
        model: payload.model,
        ip: payload.ip,
        state: payload.state,
        next_interval: payload
            .next_interval
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_NEXT_INTERVAL),
        disabled: payload.disabled.unwrap_or(false),
        last_seen: payload.last_seen.and_then(Timestamp::from_secs_f64),
    })
}

/// Only client connection events are of interest; anything else is `None`.
pub fn event(payload: EventPayload) -> Option<RawSignal> {
    let key = match payload.key.as_deref().map(EventKey::parse) {
        Some(Some(key)) => key,
        _ => {
            debug!("Ignoring event {:?}", payload.key);
            return None;
        }
    };
    let subject = payload
        .user
        .as_deref()
        .or(payload.client.as_deref())
        .or(payload.guest.as_deref());
    let mac = parse_mac(subject)?;
    Some(RawSignal {
        mac,
        timestamp: payload.time.map(Timestamp::from_millis),
        wired: Some(key.is_wired()),
        ssid: payload.ssid,
        origin: key.origin(),
    })
}
