use std::path::PathBuf;

use clap::Parser;
use log::info;

mod arbiter;
mod availability;
mod clock;
mod config;
mod debounce;
mod manager;
mod messages;
mod mqtt;
mod normalize;
mod policy;
mod registry;
mod tracker;
mod wired_bug;

/// Presence detection for clients and devices of a UniFi controller.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let config = config::AppConfig::load(&args.config)?;
    let site = config.site();
    let options = config.tracking.clone().unwrap_or_default();
    info!(
        "Tracking site {} with a detection time of {}s",
        site, options.detection_time
    );

    let registry_path = PathBuf::from(config.registry_path());
    let mut registry = registry::KnownEntities::load(&registry_path)?;
    if registry.migrate(&site) > 0 {
        registry.save(&registry_path)?;
    }

    let tracker = tracker::Tracker::new(&site, options, registry.wireless_clients());
    let (mqtt_client, eventloop) = mqtt::MqttClient::new(&config.mqtt);

    let core = manager::Manager::new(tracker, registry, registry_path, mqtt_client);
    core.run_loop(eventloop).await
}
