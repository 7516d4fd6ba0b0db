use std::time::Duration;

use anyhow::Context as _;
use log::{debug, error, info, warn};
use rumqttc::{LastWill, MqttOptions, QoS, SubscribeFilter};
use tokio::sync::mpsc;

use crate::config::{self, TrackingOptions};
use crate::messages::{ControllerMessage, EntityId, Snapshot};
use crate::tracker::EntityState;

const MESSAGE_TOPIC: &str = "controller/message";
const SNAPSHOT_TOPIC: &str = "controller/snapshot";
const STATE_TOPIC: &str = "controller/state";
const OPTIONS_TOPIC: &str = "options/set";
const PURGE_TOPIC: &str = "registry/purge";

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Everything the controller bridge and operators can tell us.
#[derive(Debug)]
pub enum Inbound {
    Controller(ControllerMessage),
    Snapshot(Snapshot),
    Options(TrackingOptions),
    Purge(EntityId),
}

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "unifi-presence".to_string());
        let topic_path = config.topic_path.clone().unwrap_or("unifi".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));
        mqttoptions.set_last_will(LastWill::new(
            status_topic(&topic_path, &publisher_id),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path,
            },
            eventloop,
        )
    }

    /// Queue the subscriptions and the online status without waiting.
    /// The event loop is the only thing draining the request queue, so it
    /// must never block on it; a full queue is retried after the next poll.
    fn try_subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client.try_subscribe_many(subscriptions(&self.topic_path))?;
        self.client.try_publish(
            status_topic(&self.topic_path, &self.publisher_id),
            QoS::AtLeastOnce,
            true,
            "online",
        )
    }

    /// Pump the MQTT connection, forwarding decoded messages in arrival order.
    /// Returns once the receiving side is gone.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: mpsc::UnboundedSender<Inbound>,
    ) {
        let mut subscribe_pending = false;
        loop {
            if subscribe_pending {
                match self.try_subscribe() {
                    Ok(()) => subscribe_pending = false,
                    Err(err) => debug!("Subscription deferred: {:?}", err),
                }
            }
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}", p.topic);

                        let message = match decode(&self.topic_path, &p.topic, &p.payload) {
                            Ok(Some(message)) => message,
                            Ok(None) => continue,
                            Err(err) => {
                                warn!("Dropping message on {}: {:#}", p.topic, err);
                                continue;
                            }
                        };

                        if tx.send(message).is_err() {
                            debug!("Receiver closed");
                            break;
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        subscribe_pending = true;
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    pub async fn announce(&self, state: &EntityState) -> anyhow::Result<()> {
        info!("Announcing {} ({}) as {}", state.name, state.id, state.state);
        let payload = serde_json::to_string(state)?;
        self.client
            .publish(self.entity_topic(&state.id), QoS::AtLeastOnce, true, payload)
            .await
            .with_context(|| format!("publishing state of {}", state.id))
    }

    /// Clears the retained state so consumers drop the entity.
    pub async fn announce_removal(&self, id: &EntityId) -> anyhow::Result<()> {
        info!("Announcing removal of {}", id);
        self.client
            .publish(self.entity_topic(id), QoS::AtLeastOnce, true, Vec::<u8>::new())
            .await
            .with_context(|| format!("publishing removal of {}", id))
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }

    fn entity_topic(&self, id: &EntityId) -> String {
        format!(
            "{}/{}/{}",
            self.topic_path,
            self.publisher_id,
            sanitize_name(id.as_str())
        )
    }
}

fn subscriptions(topic_path: &str) -> Vec<SubscribeFilter> {
    [MESSAGE_TOPIC, SNAPSHOT_TOPIC, STATE_TOPIC, OPTIONS_TOPIC, PURGE_TOPIC]
        .into_iter()
        .map(|topic| SubscribeFilter::new(format!("{}/{}", topic_path, topic), QoS::AtLeastOnce))
        .collect()
}

fn status_topic(topic_path: &str, publisher_id: &str) -> String {
    format!("{}/{}/status", topic_path, publisher_id)
}

/// `Ok(None)` for topics that are not ours.
fn decode(topic_path: &str, topic: &str, payload: &[u8]) -> anyhow::Result<Option<Inbound>> {
    let Some(topic) = topic
        .strip_prefix(topic_path)
        .and_then(|t| t.strip_prefix('/'))
    else {
        return Ok(None);
    };
    let message = match topic {
        MESSAGE_TOPIC => Inbound::Controller(serde_json::from_slice(payload)?),
        SNAPSHOT_TOPIC => Inbound::Snapshot(serde_json::from_slice(payload)?),
        STATE_TOPIC => Inbound::Controller(ControllerMessage::ControllerState(
            parse_controller_state(payload)?,
        )),
        OPTIONS_TOPIC => Inbound::Options(serde_json::from_slice(payload)?),
        PURGE_TOPIC => {
            let id = std::str::from_utf8(payload)?.trim().trim_matches('"');
            anyhow::ensure!(!id.is_empty(), "empty unique id");
            Inbound::Purge(EntityId::from(id.to_string()))
        }
        _ => return Ok(None),
    };
    Ok(Some(message))
}

fn parse_controller_state(payload: &[u8]) -> anyhow::Result<bool> {
    let state = std::str::from_utf8(payload)?.trim().trim_matches('"');
    match state.to_lowercase().as_str() {
        "true" | "online" | "connected" => Ok(true),
        "false" | "offline" | "disconnected" => Ok(false),
        other => anyhow::bail!("unknown controller state {:?}", other),
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
