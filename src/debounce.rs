//! Per-entity "mark away" deadlines.
//!
//! ```text
//!             sighting / connect
//!  NotHome ───────────────────────► Home ──┐ sighting: re-arm deadline
//!     ▲                               │ ◄──┘
//!     └────── deadline <= now ────────┘
//! ```
//!
//! The deadline table is a map keyed by entity, so arming always replaces a
//! previous deadline: there is never more than one pending timer per entity.
//! Deadlines are only acted on by [`Debouncer::expire`], called from the
//! heartbeat tick.

use std::collections::HashMap;
use std::time::Duration;

use log::trace;

use crate::clock::Timestamp;
use crate::messages::EntityId;

/// Slack added to a device's own reporting interval before it is declared away.
pub const DEVICE_HEARTBEAT_GRACE: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Debounced {
    Home,
    NotHome,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rearm {
    Armed,
    Rearmed { previous: Timestamp },
    Unchanged,
}

/// What a client signal says once arbitration has accepted it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sighting {
    /// A newer trusted `last_seen`.
    Fresh(Timestamp),
    /// Re-delivered data: judge the stored `last_seen` again without moving
    /// an already pending deadline.
    Recheck(Option<Timestamp>),
    Connected,
    Disconnected,
}

#[derive(Debug, Default)]
pub struct Debouncer {
    deadlines: HashMap<EntityId, Timestamp>,
}

impl Debouncer {
    pub fn arm(&mut self, id: &EntityId, deadline: Timestamp) -> Rearm {
        let rearm = match self.deadlines.insert(id.clone(), deadline) {
            None => Rearm::Armed,
            Some(previous) if previous == deadline => Rearm::Unchanged,
            Some(previous) => Rearm::Rearmed { previous },
        };
        trace!("Deadline for {} at {} ({:?})", id, deadline, rearm);
        rearm
    }

    pub fn cancel(&mut self, id: &EntityId) -> Option<Timestamp> {
        self.deadlines.remove(id)
    }

    pub fn pending(&self, id: &EntityId) -> Option<Timestamp> {
        self.deadlines.get(id).copied()
    }

    /// Remove and return every entity whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Timestamp) -> Vec<EntityId> {
        let mut expired: Vec<EntityId> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();
        for id in &expired {
            self.deadlines.remove(id);
        }
        expired
    }

    pub fn observe_client(
        &mut self,
        id: &EntityId,
        current: Debounced,
        sighting: Sighting,
        now: Timestamp,
        window: Duration,
    ) -> Debounced {
        match sighting {
            Sighting::Fresh(last_seen) if now < last_seen + window => {
                self.arm(id, last_seen + window);
                Debounced::Home
            }
            Sighting::Recheck(Some(last_seen)) if now < last_seen + window => {
                if self.pending(id).is_none() {
                    self.arm(id, last_seen + window);
                }
                Debounced::Home
            }
            Sighting::Fresh(_) | Sighting::Recheck(_) => {
                // Polled data outside the window. A client held home by a
                // connect event still needs a deadline from here on.
                if current == Debounced::Home && self.pending(id).is_none() {
                    self.arm(id, now + window);
                }
                current
            }
            Sighting::Connected => {
                self.cancel(id);
                Debounced::Home
            }
            Sighting::Disconnected => {
                self.arm(id, now + window);
                current
            }
        }
    }

    pub fn observe_device(
        &mut self,
        id: &EntityId,
        current: Debounced,
        connected: bool,
        next_interval: Duration,
        now: Timestamp,
    ) -> Debounced {
        if !connected {
            return current;
        }
        self.arm(id, now + next_interval + DEVICE_HEARTBEAT_GRACE);
        Debounced::Home
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(500);

    fn id() -> EntityId {
        EntityId::from("site-00:00:00:00:00:01".to_string())
    }

    fn secs(s: i64) -> Timestamp {
        Timestamp::from_secs(s)
    }

    #[test]
    fn test_arm_replaces_previous_deadline() {
        let mut debouncer = Debouncer::default();
        assert_eq!(debouncer.arm(&id(), secs(10)), Rearm::Armed);
        assert_eq!(debouncer.arm(&id(), secs(10)), Rearm::Unchanged);
        assert_eq!(debouncer.arm(&id(), secs(20)), Rearm::Rearmed { previous: secs(10) });
        assert_eq!(debouncer.pending(&id()), Some(secs(20)));
        assert!(debouncer.expire(secs(19)).is_empty());
        assert_eq!(debouncer.expire(secs(20)), vec![id()]);
        assert_eq!(debouncer.pending(&id()), None);
    }

    #[test]
    fn test_fresh_sighting_marks_home_until_window_ends() {
        let mut debouncer = Debouncer::default();
        let state = debouncer.observe_client(
            &id(),
            Debounced::NotHome,
            Sighting::Fresh(secs(1000)),
            secs(1000),
            WINDOW,
        );
        assert_eq!(state, Debounced::Home);
        assert_eq!(debouncer.pending(&id()), Some(secs(1500)));

        // Re-delivery one second before the deadline does not extend it.
        let state = debouncer.observe_client(
            &id(),
            Debounced::Home,
            Sighting::Recheck(Some(secs(1000))),
            secs(1499),
            WINDOW,
        );
        assert_eq!(state, Debounced::Home);
        assert_eq!(debouncer.pending(&id()), Some(secs(1500)));
        assert_eq!(debouncer.expire(secs(1500)), vec![id()]);
    }

    #[test]
    fn test_expired_sighting_changes_nothing() {
        let mut debouncer = Debouncer::default();
        let state = debouncer.observe_client(
            &id(),
            Debounced::NotHome,
            Sighting::Fresh(secs(1000)),
            secs(1500),
            WINDOW,
        );
        assert_eq!(state, Debounced::NotHome);
        assert_eq!(debouncer.pending(&id()), None);
    }

    #[test]
    fn test_stale_poll_after_connect_arms_from_now() {
        let mut debouncer = Debouncer::default();
        let state = debouncer.observe_client(
            &id(),
            Debounced::Home,
            Sighting::Recheck(Some(secs(10))),
            secs(1000),
            WINDOW,
        );
        assert_eq!(state, Debounced::Home);
        assert_eq!(debouncer.pending(&id()), Some(secs(1500)));
    }

    #[test]
    fn test_connect_cancels_and_disconnect_arms_from_now() {
        let mut debouncer = Debouncer::default();
        debouncer.arm(&id(), secs(10));
        let state =
            debouncer.observe_client(&id(), Debounced::NotHome, Sighting::Connected, secs(5), WINDOW);
        assert_eq!(state, Debounced::Home);
        assert_eq!(debouncer.pending(&id()), None);

        let state =
            debouncer.observe_client(&id(), Debounced::Home, Sighting::Disconnected, secs(5), WINDOW);
        assert_eq!(state, Debounced::Home);
        assert_eq!(debouncer.pending(&id()), Some(secs(505)));
    }

    #[test]
    fn test_device_heartbeat() {
        let mut debouncer = Debouncer::default();
        let state = debouncer.observe_device(
            &id(),
            Debounced::NotHome,
            true,
            Duration::from_secs(20),
            secs(0),
        );
        assert_eq!(state, Debounced::Home);
        assert_eq!(debouncer.pending(&id()), Some(secs(80)));

        let state = debouncer.observe_device(
            &id(),
            Debounced::Home,
            false,
            Duration::from_secs(20),
            secs(50),
        );
        assert_eq!(state, Debounced::Home);
        assert_eq!(debouncer.pending(&id()), Some(secs(80)));
    }
}
