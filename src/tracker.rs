//! The presence core. Owns every tracked entity, the remembered controller
//! data behind them, the wired-bug filter and the deadline table.
//!
//! All inputs are funneled through `&mut self` methods that take the current
//! wall-clock time and return the observable changes they caused, so the
//! caller decides how and when to publish them.

use std::collections::{HashMap, HashSet};
use std::mem;

use log::{debug, info};
use mac_address::MacAddress;
use serde_derive::Serialize;

use crate::arbiter::{Arbitration, SourceState, arbitrate};
use crate::availability::overlay;
use crate::clock::Timestamp;
use crate::config::TrackingOptions;
use crate::debounce::{Debounced, Debouncer, Sighting};
use crate::messages::{ControllerMessage, EntityId, EntityKind, Presence, Snapshot};
use crate::normalize::{self, ClientRecord, DeviceRecord, Origin, RawSignal};
use crate::policy::{admit_client, admit_device};
use crate::registry::KnownEntities;
use crate::wired_bug::WiredBugFilter;

/// Everything observers are told about an entity.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntityState {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: String,
    pub state: Presence,
    /// Unix seconds.
    pub last_seen: Option<i64>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub ssid: Option<String>,
    pub is_wired: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    Updated(EntityState),
    Removed(EntityId),
}

#[derive(Debug)]
struct TrackedEntity {
    id: EntityId,
    kind: EntityKind,
    mac: MacAddress,
    debounced: Debounced,
    last_seen: Option<Timestamp>,
    wired: bool,
    name: String,
    hostname: Option<String>,
    ip: Option<String>,
    ssid: Option<String>,
    disabled: bool,
    sources: SourceState,
    reported: Option<EntityState>,
}

impl TrackedEntity {
    fn client(id: EntityId, record: &ClientRecord, wired: bool, sources: SourceState) -> Self {
        let mut entity = TrackedEntity {
            id,
            kind: EntityKind::Client,
            mac: record.mac,
            debounced: Debounced::NotHome,
            last_seen: None,
            wired,
            name: String::new(),
            hostname: None,
            ip: None,
            ssid: None,
            disabled: false,
            sources,
            reported: None,
        };
        entity.update_client(record, wired);
        entity
    }

    fn device(id: EntityId, record: &DeviceRecord) -> Self {
        let mut entity = TrackedEntity {
            id,
            kind: EntityKind::Device,
            mac: record.mac,
            debounced: Debounced::NotHome,
            last_seen: None,
            wired: true,
            name: String::new(),
            hostname: None,
            ip: None,
            ssid: None,
            disabled: false,
            sources: SourceState::default(),
            reported: None,
        };
        entity.update_device(record);
        entity
    }

    /// Static attributes only; `last_seen` belongs to the arbiter.
    fn update_client(&mut self, record: &ClientRecord, wired: bool) {
        self.name = record.display_name();
        self.hostname = record.hostname.clone();
        self.ip = record.ip.clone();
        self.ssid = if wired { None } else { record.essid.clone() };
        self.wired = wired;
    }

    fn update_device(&mut self, record: &DeviceRecord) {
        self.name = record.display_name();
        self.ip = record.ip.clone();
        self.disabled = record.disabled;
        self.last_seen = match (self.last_seen, record.last_seen) {
            (Some(current), Some(new)) => Some(current.max(new)),
            (current, new) => current.or(new),
        };
    }

    fn advance_last_seen(&mut self, ts: Timestamp) {
        self.last_seen = Some(self.last_seen.map_or(ts, |seen| seen.max(ts)));
    }

    fn state(&self, controller_connected: bool) -> EntityState {
        EntityState {
            id: self.id.clone(),
            kind: self.kind,
            name: self.name.clone(),
            state: overlay(controller_connected, self.disabled, self.debounced),
            last_seen: self.last_seen.map(Timestamp::as_secs),
            ip: self.ip.clone(),
            hostname: self.hostname.clone(),
            ssid: self.ssid.clone(),
            is_wired: self.wired,
        }
    }
}

pub struct Tracker {
    site: String,
    options: TrackingOptions,
    controller_connected: bool,
    entities: HashMap<EntityId, TrackedEntity>,
    clients: HashMap<MacAddress, ClientRecord>,
    devices: HashMap<MacAddress, DeviceRecord>,
    wired_bug: WiredBugFilter,
    debouncer: Debouncer,
}

impl Tracker {
    pub fn new(site: &str, options: TrackingOptions, known_wireless: Vec<MacAddress>) -> Self {
        Tracker {
            site: site.to_string(),
            options,
            controller_connected: true,
            entities: HashMap::new(),
            clients: HashMap::new(),
            devices: HashMap::new(),
            wired_bug: WiredBugFilter::new(known_wireless),
            debouncer: Debouncer::default(),
        }
    }

    pub fn options(&self) -> &TrackingOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn presence(&self, id: &EntityId) -> Option<Presence> {
        self.entity_state(id).map(|state| state.state)
    }

    pub fn entity_state(&self, id: &EntityId) -> Option<EntityState> {
        self.entities
            .get(id)
            .map(|entity| entity.state(self.controller_connected))
    }

    pub fn deadline(&self, id: &EntityId) -> Option<Timestamp> {
        self.debouncer.pending(id)
    }

    pub fn wireless_clients(&self) -> impl Iterator<Item = &MacAddress> {
        self.wired_bug.wireless_clients()
    }

    pub fn take_wireless_changed(&mut self) -> bool {
        self.wired_bug.take_wireless_changed()
    }

    /// Load the controller's startup data. Clients in `clients_all` without
    /// live data are restored only when `registry` has seen them before.
    pub fn initialize(
        &mut self,
        snapshot: Snapshot,
        registry: &KnownEntities,
        now: Timestamp,
    ) -> Vec<Change> {
        let mut changes = Vec::new();
        for record in snapshot.devices.into_iter().filter_map(normalize::device) {
            self.observe_device(record, now, &mut changes);
        }

        let mut live = HashSet::new();
        for record in snapshot.clients.into_iter().filter_map(normalize::client) {
            live.insert(record.mac);
            self.seed_client(record, now, &mut changes);
        }

        for record in snapshot.clients_all.into_iter().filter_map(normalize::client) {
            if live.contains(&record.mac) {
                continue;
            }
            let id = EntityId::new(&self.site, &record.mac);
            if !registry.contains(&id) {
                continue;
            }
            info!("Restoring {} ({})", id, record.display_name());
            self.seed_client(record, now, &mut changes);
        }
        info!("Tracking {} entities after startup", self.entities.len());
        changes
    }

    pub fn handle(&mut self, message: ControllerMessage, now: Timestamp) -> Vec<Change> {
        let mut changes = Vec::new();
        match message {
            ControllerMessage::Client(payloads) => {
                for record in payloads.into_vec().into_iter().filter_map(normalize::client) {
                    self.observe_client(record, now, &mut changes);
                }
            }
            ControllerMessage::Device(payloads) => {
                for record in payloads.into_vec().into_iter().filter_map(normalize::device) {
                    self.observe_device(record, now, &mut changes);
                }
            }
            ControllerMessage::Event(payloads) => {
                for signal in payloads.into_vec().into_iter().filter_map(normalize::event) {
                    self.observe_event(signal, now, &mut changes);
                }
            }
            ControllerMessage::ClientRemoved(payloads) => {
                for record in payloads.into_vec().into_iter().filter_map(normalize::client) {
                    self.forget_client(&record.mac, &mut changes);
                }
            }
            ControllerMessage::ControllerState(connected) => {
                self.set_controller_connected(connected, now, &mut changes);
            }
        }
        changes
    }

    /// Heartbeat: every entity whose deadline passed goes away.
    pub fn tick(&mut self, now: Timestamp) -> Vec<Change> {
        let mut changes = Vec::new();
        self.expire(now, &mut changes);
        changes
    }

    /// Apply new options and re-evaluate every remembered client and device.
    pub fn set_options(&mut self, options: TrackingOptions, now: Timestamp) -> Vec<Change> {
        let mut changes = Vec::new();
        let previous = mem::replace(&mut self.options, options);
        if previous == self.options {
            return changes;
        }
        info!("Tracking options changed, re-evaluating entities");
        if self.options.ignore_wired_bug {
            self.wired_bug.release_all();
        }

        let mut rejected: Vec<EntityId> = self
            .entities
            .values()
            .filter(|entity| !self.still_admitted(entity))
            .map(|entity| entity.id.clone())
            .collect();
        rejected.sort();
        for id in rejected {
            info!("Removing {}, no longer allowed", id);
            self.remove_entity(&id, &mut changes);
        }

        let mut devices: Vec<DeviceRecord> = self.devices.values().cloned().collect();
        devices.sort_by_key(|d| EntityId::new(&self.site, &d.mac));
        for record in devices {
            if !self.entities.contains_key(&EntityId::new(&self.site, &record.mac)) {
                self.observe_device(record, now, &mut changes);
            }
        }

        let mut macs: Vec<MacAddress> = self.clients.keys().copied().collect();
        macs.sort_by_key(|mac| EntityId::new(&self.site, mac));
        for mac in macs {
            self.create_client(&mac, now, &mut changes);
        }
        changes
    }

    /// The entity registry dropped `id`.
    pub fn purge(&mut self, id: &EntityId) -> Vec<Change> {
        let mut changes = Vec::new();
        // Entities filtered out by policy still have remembered data.
        let Some(mac) = self
            .entities
            .get(id)
            .map(|entity| entity.mac)
            .or_else(|| self.mac_of(id))
        else {
            debug!("Nothing to purge for {}", id);
            return changes;
        };
        info!("Purging {}", id);
        self.clients.remove(&mac);
        self.devices.remove(&mac);
        self.wired_bug.forget(&mac);
        self.remove_entity(id, &mut changes);
        changes
    }

    fn mac_of(&self, id: &EntityId) -> Option<MacAddress> {
        id.as_str()
            .strip_prefix(self.site.as_str())?
            .strip_prefix('-')?
            .parse()
            .ok()
    }

    fn still_admitted(&self, entity: &TrackedEntity) -> bool {
        match entity.kind {
            EntityKind::Client => self.clients.get(&entity.mac).is_some_and(|record| {
                let wired = self.wired_bug.classification(&record.mac, record.is_wired);
                admit_client(&self.options, record, wired).is_allowed()
            }),
            EntityKind::Device => self
                .devices
                .get(&entity.mac)
                .is_some_and(|record| admit_device(&self.options, record).is_allowed()),
        }
    }

    fn remember_client(&mut self, record: ClientRecord) -> ClientRecord {
        match self.clients.get_mut(&record.mac) {
            Some(remembered) => {
                remembered.absorb(record);
                remembered.clone()
            }
            None => {
                self.clients.insert(record.mac, record.clone());
                record
            }
        }
    }

    /// Startup and restored data: judged, but not a live poll.
    fn seed_client(&mut self, record: ClientRecord, now: Timestamp, changes: &mut Vec<Change>) {
        self.wired_bug.assess(
            record.mac,
            record.is_wired,
            record.last_seen,
            self.options.detection_time(),
            self.options.ignore_wired_bug,
        );
        let mac = record.mac;
        self.remember_client(record);
        self.create_client(&mac, now, changes);
    }

    /// Build an entity from remembered data if policy allows and none exists.
    fn create_client(&mut self, mac: &MacAddress, now: Timestamp, changes: &mut Vec<Change>) {
        let Some(record) = self.clients.get(mac) else {
            return;
        };
        let id = EntityId::new(&self.site, mac);
        if self.entities.contains_key(&id) {
            return;
        }
        let wired = self.wired_bug.classification(mac, record.is_wired);
        let admission = admit_client(&self.options, record, wired);
        if !admission.is_allowed() {
            debug!("Not tracking {}: {:?}", id, admission);
            return;
        }

        let mut entity =
            TrackedEntity::client(id.clone(), record, wired, SourceState::seeded(record.last_seen));
        entity.last_seen = record.last_seen;
        let suspect = self.wired_bug.is_latched(mac) && !self.options.ignore_wired_bug;
        if !suspect {
            entity.debounced = self.debouncer.observe_client(
                &id,
                Debounced::NotHome,
                Sighting::Recheck(record.last_seen),
                now,
                self.options.detection_time(),
            );
        }
        info!("Tracking client {} ({})", id, entity.name);
        self.entities.insert(id.clone(), entity);
        self.report(&id, changes);
    }

    fn observe_client(&mut self, mut record: ClientRecord, now: Timestamp, changes: &mut Vec<Change>) {
        let window = self.options.detection_time();
        let assessment = self.wired_bug.assess(
            record.mac,
            record.is_wired,
            record.last_seen,
            window,
            self.options.ignore_wired_bug,
        );
        if assessment.suspect && !self.wired_bug.is_latched(&record.mac) {
            // Stale wired report: keep the remembered classification.
            record.is_wired = None;
        }
        let signal = record.poll_signal();
        let remembered = self.remember_client(record);
        let id = EntityId::new(&self.site, &remembered.mac);

        let admission = admit_client(&self.options, &remembered, assessment.wired);
        if !admission.is_allowed() {
            if self.entities.contains_key(&id) {
                info!("Removing {}: {:?}", id, admission);
                self.remove_entity(&id, changes);
            }
            return;
        }

        let entity = self.entities.entry(id.clone()).or_insert_with(|| {
            info!("Tracking client {} ({})", id, remembered.display_name());
            TrackedEntity::client(id.clone(), &remembered, assessment.wired, SourceState::default())
        });
        entity.update_client(&remembered, assessment.wired);

        if assessment.suspect {
            entity.sources.mark_polled();
        } else {
            let sighting = match (arbitrate(&entity.sources, &signal), signal.timestamp) {
                (Arbitration::Fresh, Some(ts)) => {
                    entity.advance_last_seen(ts);
                    Sighting::Fresh(ts)
                }
                _ => Sighting::Recheck(entity.last_seen),
            };
            entity.sources.record(&signal);
            entity.debounced =
                self.debouncer
                    .observe_client(&id, entity.debounced, sighting, now, window);
        }
        self.report(&id, changes);
    }

    fn observe_event(&mut self, signal: RawSignal, now: Timestamp, changes: &mut Vec<Change>) {
        let id = EntityId::new(&self.site, &signal.mac);
        let Some(entity) = self.entities.get_mut(&id) else {
            debug!("Event for untracked client {}", id);
            return;
        };
        if entity.kind != EntityKind::Client || arbitrate(&entity.sources, &signal) != Arbitration::Fresh {
            return;
        }
        entity.sources.record(&signal);

        let sighting = match signal.origin {
            Origin::EventConnect => {
                if let Some(ts) = signal.timestamp {
                    entity.advance_last_seen(ts);
                }
                if let Some(ssid) = signal.ssid.filter(|_| !entity.wired) {
                    entity.ssid = Some(ssid.clone());
                    if let Some(record) = self.clients.get_mut(&signal.mac) {
                        record.essid = Some(ssid);
                        let admission = admit_client(&self.options, record, entity.wired);
                        if !admission.is_allowed() {
                            info!("Removing {}: {:?}", id, admission);
                            self.remove_entity(&id, changes);
                            return;
                        }
                    }
                }
                Sighting::Connected
            }
            Origin::EventDisconnect => Sighting::Disconnected,
            Origin::Poll => return,
        };
        entity.debounced = self.debouncer.observe_client(
            &id,
            entity.debounced,
            sighting,
            now,
            self.options.detection_time(),
        );
        self.report(&id, changes);
    }

    fn observe_device(&mut self, record: DeviceRecord, now: Timestamp, changes: &mut Vec<Change>) {
        self.devices.insert(record.mac, record.clone());
        let id = EntityId::new(&self.site, &record.mac);

        let admission = admit_device(&self.options, &record);
        if !admission.is_allowed() {
            if self.entities.contains_key(&id) {
                info!("Removing {}: {:?}", id, admission);
                self.remove_entity(&id, changes);
            }
            return;
        }

        let entity = self.entities.entry(id.clone()).or_insert_with(|| {
            info!("Tracking device {} ({})", id, record.display_name());
            TrackedEntity::device(id.clone(), &record)
        });
        entity.update_device(&record);
        entity.debounced = self.debouncer.observe_device(
            &id,
            entity.debounced,
            record.is_connected(),
            record.next_interval,
            now,
        );
        self.report(&id, changes);
    }

    fn forget_client(&mut self, mac: &MacAddress, changes: &mut Vec<Change>) {
        let id = EntityId::new(&self.site, mac);
        self.clients.remove(mac);
        self.wired_bug.forget(mac);
        if self.entities.contains_key(&id) {
            info!("Client {} removed by controller", id);
            self.remove_entity(&id, changes);
        }
    }

    fn set_controller_connected(
        &mut self,
        connected: bool,
        now: Timestamp,
        changes: &mut Vec<Change>,
    ) {
        if self.controller_connected == connected {
            return;
        }
        info!(
            "Controller {}",
            if connected { "available" } else { "unavailable" }
        );
        self.controller_connected = connected;
        if connected {
            // Deadlines that passed during the outage resolve before anything
            // is re-announced.
            self.expire(now, changes);
        }
        let mut ids: Vec<EntityId> = self.entities.keys().cloned().collect();
        ids.sort();
        for id in ids {
            self.report(&id, changes);
        }
    }

    fn expire(&mut self, now: Timestamp, changes: &mut Vec<Change>) {
        for id in self.debouncer.expire(now) {
            if let Some(entity) = self.entities.get_mut(&id) {
                debug!("{} not seen in time, marking away", id);
                entity.debounced = Debounced::NotHome;
            }
            self.report(&id, changes);
        }
    }

    fn remove_entity(&mut self, id: &EntityId, changes: &mut Vec<Change>) {
        self.debouncer.cancel(id);
        if self.entities.remove(id).is_some() {
            changes.push(Change::Removed(id.clone()));
        }
    }

    /// Queue an update if what observers see differs from the last report.
    fn report(&mut self, id: &EntityId, changes: &mut Vec<Change>) {
        let Some(entity) = self.entities.get_mut(id) else {
            return;
        };
        let state = entity.state(self.controller_connected);
        if entity.reported.as_ref() != Some(&state) {
            entity.reported = Some(state.clone());
            changes.push(Change::Updated(state));
        }
    }
}
