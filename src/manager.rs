use std::path::PathBuf;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::clock::Timestamp;
use crate::messages::{ControllerMessage, OneOrMany};
use crate::mqtt::{Inbound, MqttClient};
use crate::registry::KnownEntities;
use crate::tracker::{Change, Tracker};

/// How often pending deadlines are checked.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub struct Manager {
    tracker: Tracker,
    registry: KnownEntities,
    registry_path: PathBuf,
    mqtt_client: MqttClient,
    initialized: bool,
}

impl Manager {
    pub fn new(
        tracker: Tracker,
        registry: KnownEntities,
        registry_path: PathBuf,
        mqtt_client: MqttClient,
    ) -> Self {
        Manager {
            tracker,
            registry,
            registry_path,
            mqtt_client,
            initialized: false,
        }
    }

    pub async fn run_loop(mut self, mut eventloop: rumqttc::EventLoop) -> anyhow::Result<()> {
        // A single ordered channel: controller messages must reach the
        // tracker in the order the bridge sent them. Unbounded so the MQTT
        // task never waits on us while we wait on it to drain publishes.
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mqtt_client = self.mqtt_client.clone();
        tokio::task::spawn(async move {
            mqtt_client.event_loop(&mut eventloop, tx).await;
        });

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                inbound = rx.recv() => {
                    let Some(inbound) = inbound else {
                        warn!("MQTT event loop stopped");
                        break;
                    };
                    let changes = self.dispatch(inbound, Timestamp::now());
                    self.publish(changes).await;
                }
                _ = heartbeat.tick() => {
                    let changes = self.tracker.tick(Timestamp::now());
                    self.publish(changes).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received interrupt, shutting down");
                    break;
                }
            }
        }

        self.save_registry();
        info!("Exiting manager event loop with {} tracked entities", self.tracker.len());
        self.mqtt_client.disconnect().await?;

        Ok(())
    }

    fn dispatch(&mut self, inbound: Inbound, now: Timestamp) -> Vec<Change> {
        match inbound {
            Inbound::Snapshot(snapshot) if !self.initialized => {
                self.initialized = true;
                self.tracker.initialize(snapshot, &self.registry, now)
            }
            Inbound::Snapshot(snapshot) => {
                debug!("Applying repeated snapshot as live data");
                let mut changes = self
                    .tracker
                    .handle(ControllerMessage::Device(OneOrMany::Many(snapshot.devices)), now);
                changes.extend(
                    self.tracker
                        .handle(ControllerMessage::Client(OneOrMany::Many(snapshot.clients)), now),
                );
                changes
            }
            Inbound::Controller(message) => self.tracker.handle(message, now),
            Inbound::Options(options) => {
                info!("Applying new tracking options");
                self.tracker.set_options(options, now)
            }
            Inbound::Purge(id) => {
                if self.registry.remove(&id) {
                    info!("Purged {} from the registry", id);
                    self.save_registry();
                }
                self.tracker.purge(&id)
            }
        }
    }

    async fn publish(&mut self, changes: Vec<Change>) {
        let mut dirty = false;
        for change in changes {
            let result = match &change {
                Change::Updated(state) => {
                    dirty |= self.registry.register(&state.id);
                    self.mqtt_client.announce(state).await
                }
                Change::Removed(id) => self.mqtt_client.announce_removal(id).await,
            };
            if let Err(err) = result {
                error!("Error publishing change: {:#}", err);
            }
        }

        if self.tracker.take_wireless_changed() {
            dirty |= self
                .registry
                .set_wireless_clients(self.tracker.wireless_clients());
        }
        if dirty {
            self.save_registry();
        }
    }

    fn save_registry(&self) {
        if let Err(err) = self.registry.save(&self.registry_path) {
            warn!("Could not save registry: {:#}", err);
        }
    }
}
