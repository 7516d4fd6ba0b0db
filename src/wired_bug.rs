//! UniFi controllers sometimes report a wireless client as wired for a
//! polling cycle right before it drops off the network. Trusting that report
//! would reclassify the client and keep it "seen" for another detection
//! window, so reports from known-wireless clients claiming to be wired are
//! held as suspect until the client proves it.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::time::Duration;

use log::{debug, info};
use mac_address::MacAddress;

use crate::clock::Timestamp;

/// How a single client report should be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WiredAssessment {
    /// Effective classification, the one policy and attributes use.
    pub wired: bool,
    /// The report is probably the wired bug: it must not count as a sighting.
    pub suspect: bool,
}

#[derive(Debug, Default)]
pub struct WiredBugFilter {
    wireless: HashSet<MacAddress>,
    /// Clients currently latched, with the `last_seen` of their first wired report.
    latched: HashMap<MacAddress, Option<Timestamp>>,
    /// Newest `last_seen` of a report that was taken at face value.
    trusted: HashMap<MacAddress, Timestamp>,
    wireless_changed: bool,
}

impl WiredBugFilter {
    pub fn new(known_wireless: impl IntoIterator<Item = MacAddress>) -> Self {
        WiredBugFilter {
            wireless: known_wireless.into_iter().collect(),
            latched: HashMap::new(),
            trusted: HashMap::new(),
            wireless_changed: false,
        }
    }

    pub fn is_wireless(&self, mac: &MacAddress) -> bool {
        self.wireless.contains(mac)
    }

    pub fn is_latched(&self, mac: &MacAddress) -> bool {
        self.latched.contains_key(mac)
    }

    pub fn wireless_clients(&self) -> impl Iterator<Item = &MacAddress> {
        self.wireless.iter()
    }

    /// Whether the known-wireless set changed since the last call.
    pub fn take_wireless_changed(&mut self) -> bool {
        mem::take(&mut self.wireless_changed)
    }

    /// Classification for a client without a new report.
    pub fn classification(&self, mac: &MacAddress, reported_wired: Option<bool>) -> bool {
        if self.is_latched(mac) {
            return false;
        }
        reported_wired.unwrap_or(!self.is_wireless(mac))
    }

    /// Judge one report. `window` is the stretch of continuous wired
    /// reporting after which a latched client is accepted as rewired.
    pub fn assess(
        &mut self,
        mac: MacAddress,
        reported_wired: Option<bool>,
        last_seen: Option<Timestamp>,
        window: Duration,
        ignore_bug: bool,
    ) -> WiredAssessment {
        match reported_wired {
            Some(false) => {
                self.wireless_changed |= self.wireless.insert(mac);
                if self.latched.remove(&mac).is_some() {
                    debug!("Client {} is reporting wireless again", mac);
                }
                self.trust(mac, last_seen);
                WiredAssessment {
                    wired: false,
                    suspect: false,
                }
            }
            Some(true) if ignore_bug || !self.wireless.contains(&mac) => {
                self.trust(mac, last_seen);
                WiredAssessment {
                    wired: true,
                    suspect: false,
                }
            }
            Some(true) if !self.is_latched(&mac) && !self.is_newer(&mac, last_seen) => {
                // Re-delivered or undated: nothing to latch on.
                WiredAssessment {
                    wired: false,
                    suspect: true,
                }
            }
            Some(true) => {
                let since = self.latched.entry(mac).or_insert(None);
                if since.is_none() {
                    debug!("Wireless client {} reported as wired, holding as wireless", mac);
                    *since = last_seen;
                }
                let rewired = match (*since, last_seen) {
                    (Some(since), Some(seen)) => seen >= since + window,
                    _ => false,
                };
                if rewired {
                    info!("Client {} stayed wired for a full window, treating as wired", mac);
                    self.latched.remove(&mac);
                    self.wireless_changed |= self.wireless.remove(&mac);
                    self.trust(mac, last_seen);
                    WiredAssessment {
                        wired: true,
                        suspect: false,
                    }
                } else {
                    WiredAssessment {
                        wired: false,
                        suspect: true,
                    }
                }
            }
            None => {
                self.trust(mac, last_seen);
                WiredAssessment {
                    wired: self.classification(&mac, None),
                    suspect: false,
                }
            }
        }
    }

    fn is_newer(&self, mac: &MacAddress, last_seen: Option<Timestamp>) -> bool {
        match (last_seen, self.trusted.get(mac)) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(seen), Some(trusted)) => seen > *trusted,
        }
    }

    fn trust(&mut self, mac: MacAddress, last_seen: Option<Timestamp>) {
        if let Some(seen) = last_seen {
            let trusted = self.trusted.entry(mac).or_insert(seen);
            *trusted = (*trusted).max(seen);
        }
    }

    pub fn forget(&mut self, mac: &MacAddress) {
        self.latched.remove(mac);
        self.trusted.remove(mac);
    }

    /// Drop every latch, used when the filter gets switched off.
    pub fn release_all(&mut self) {
        self.latched.clear();
    }
}
