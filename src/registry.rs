//! The set of unique ids that have ever been announced, plus the clients
//! known to be wireless. Persisted as JSON so a restart can restore entities
//! the controller has no live data for and keep the wired-bug filter armed.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context as _;
use log::{debug, info};
use mac_address::MacAddress;
use serde_derive::{Deserialize, Serialize};

use crate::messages::{EntityId, format_mac};

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct KnownEntities {
    unique_ids: BTreeSet<String>,
    wireless_clients: BTreeSet<String>,
}

impl KnownEntities {
    /// A missing file is an empty registry.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!("No registry at {}, starting empty", path.display());
            return Ok(KnownEntities::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading registry {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing registry {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("writing registry {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("replacing registry {}", path.display()))?;
        debug!("Saved registry with {} entities", self.unique_ids.len());
        Ok(())
    }

    /// Older releases keyed clients as `{mac}-{site}`; rewrite those to
    /// `{site}-{mac}`.
    pub fn migrate(&mut self, site: &str) -> usize {
        let suffix = format!("-{}", site);
        let legacy: Vec<(String, String)> = self
            .unique_ids
            .iter()
            .filter_map(|id| {
                let mac = id.strip_suffix(&suffix)?.parse::<MacAddress>().ok()?;
                Some((id.clone(), EntityId::new(site, &mac).as_str().to_string()))
            })
            .collect();
        for (old, new) in &legacy {
            info!("Migrating unique id {} to {}", old, new);
            self.unique_ids.remove(old);
            self.unique_ids.insert(new.clone());
        }
        legacy.len()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.unique_ids.contains(id.as_str())
    }

    pub fn register(&mut self, id: &EntityId) -> bool {
        self.unique_ids.insert(id.as_str().to_string())
    }

    pub fn remove(&mut self, id: &EntityId) -> bool {
        self.unique_ids.remove(id.as_str())
    }

    pub fn len(&self) -> usize {
        self.unique_ids.len()
    }

    pub fn wireless_clients(&self) -> Vec<MacAddress> {
        self.wireless_clients
            .iter()
            .filter_map(|mac| mac.parse().ok())
            .collect()
    }

    /// Returns whether the stored set changed.
    pub fn set_wireless_clients<'a>(&mut self, macs: impl IntoIterator<Item = &'a MacAddress>) -> bool {
        let macs: BTreeSet<String> = macs.into_iter().map(format_mac).collect();
        if macs == self.wireless_clients {
            return false;
        }
        self.wireless_clients = macs;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_legacy_ids() {
        let mut registry = KnownEntities::default();
        registry.unique_ids.insert("00:00:00:00:00:02-site_id".into());
        registry.unique_ids.insert("site_id-00:00:00:00:00:01".into());

        assert_eq!(registry.migrate("site_id"), 1);

        let mac: MacAddress = "00:00:00:00:00:02".parse().unwrap();
        assert!(registry.contains(&EntityId::new("site_id", &mac)));
        assert!(registry.contains(&EntityId::from("site_id-00:00:00:00:00:01".to_string())));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_wireless_clients_round_trip_through_strings() {
        let mut registry = KnownEntities::default();
        let mac: MacAddress = "AA:00:00:00:00:04".parse().unwrap();
        assert!(registry.set_wireless_clients([&mac]));
        assert!(!registry.set_wireless_clients([&mac]));
        assert_eq!(registry.wireless_clients(), vec![mac]);
    }

    #[test]
    fn test_load_missing_and_save() {
        let dir = std::env::temp_dir().join(format!("unifi-presence-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("registry.json");
        let _ = std::fs::remove_file(&path);

        let mut registry = KnownEntities::load(&path).unwrap();
        assert_eq!(registry.len(), 0);
        registry.register(&EntityId::from("default-00:00:00:00:00:01".to_string()));
        registry.save(&path).unwrap();

        let loaded = KnownEntities::load(&path).unwrap();
        assert_eq!(loaded, registry);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
