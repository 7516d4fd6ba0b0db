use crate::config::TrackingOptions;
use crate::normalize::{ClientRecord, DeviceRecord};

/// Outcome of checking an entity against the tracking options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Blocked,
    ClientsNotTracked,
    WiredNotTracked,
    SsidFiltered,
    DevicesNotTracked,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        *self == Admission::Allowed
    }
}

/// `wired` is the effective classification from the wired-bug filter, not
/// necessarily what the last report said.
pub fn admit_client(options: &TrackingOptions, client: &ClientRecord, wired: bool) -> Admission {
    if options.block_client.contains(&client.mac) {
        return Admission::Blocked;
    }
    if options.client_source.contains(&client.mac) {
        return Admission::Allowed;
    }
    if !options.track_clients {
        return Admission::ClientsNotTracked;
    }
    if wired {
        if !options.track_wired_clients {
            return Admission::WiredNotTracked;
        }
        return Admission::Allowed;
    }
    match client.essid.as_deref() {
        Some(ssid) if !options.ssid_filter.is_empty() && !options.ssid_filter.contains(ssid) => {
            Admission::SsidFiltered
        }
        _ => Admission::Allowed,
    }
}

pub fn admit_device(options: &TrackingOptions, _device: &DeviceRecord) -> Admission {
    if options.track_devices {
        Admission::Allowed
    } else {
        Admission::DevicesNotTracked
    }
}
