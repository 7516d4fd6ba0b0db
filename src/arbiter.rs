//! Precedence between the two data sources the controller offers.
//!
//! Polled client data is authoritative: once a live poll has been seen for a
//! client its connect and disconnect events are ignored, otherwise the two
//! sources race and the entity flaps. Independently, nothing older than what
//! is already recorded is ever accepted.

use log::debug;

use crate::clock::Timestamp;
use crate::normalize::{Origin, RawSignal};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arbitration {
    /// Newer than anything recorded for its source.
    Fresh,
    /// Same or older timestamp than already recorded.
    Stale,
    /// A poll without `last_seen`; only static attributes may change.
    Undated,
    /// An event for a client whose polled data is available.
    IgnoredAfterPoll,
}

/// Per-entity record of what each source has delivered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceState {
    polled: bool,
    last_poll: Option<Timestamp>,
    last_connect: Option<Timestamp>,
    last_disconnect: Option<Timestamp>,
}

impl SourceState {
    /// State for an entity created from startup or restored data. That data
    /// bounds event freshness but is not a live poll.
    pub fn seeded(last_poll: Option<Timestamp>) -> Self {
        SourceState {
            last_poll,
            ..Default::default()
        }
    }

    pub fn has_polled(&self) -> bool {
        self.polled
    }

    pub fn last_poll(&self) -> Option<Timestamp> {
        self.last_poll
    }

    /// A live poll arrived, whatever came of it.
    pub fn mark_polled(&mut self) {
        self.polled = true;
    }

    /// Remember an accepted signal.
    pub fn record(&mut self, signal: &RawSignal) {
        let Some(ts) = signal.timestamp else {
            if signal.origin == Origin::Poll {
                self.polled = true;
            }
            return;
        };
        let slot = match signal.origin {
            Origin::Poll => {
                self.polled = true;
                &mut self.last_poll
            }
            Origin::EventConnect => &mut self.last_connect,
            Origin::EventDisconnect => &mut self.last_disconnect,
        };
        *slot = Some(slot.map_or(ts, |seen| seen.max(ts)));
    }
}

pub fn arbitrate(state: &SourceState, signal: &RawSignal) -> Arbitration {
    let verdict = match signal.origin {
        Origin::Poll => match signal.timestamp {
            None => Arbitration::Undated,
            Some(ts) if state.last_poll.is_some_and(|seen| ts <= seen) => Arbitration::Stale,
            Some(_) => Arbitration::Fresh,
        },
        Origin::EventConnect | Origin::EventDisconnect if state.polled => {
            Arbitration::IgnoredAfterPoll
        }
        Origin::EventConnect | Origin::EventDisconnect => {
            let same_kind = match signal.origin {
                Origin::EventConnect => state.last_connect,
                _ => state.last_disconnect,
            };
            match signal.timestamp {
                Some(ts)
                    if [state.last_poll, same_kind]
                        .into_iter()
                        .flatten()
                        .any(|seen| ts <= seen) =>
                {
                    Arbitration::Stale
                }
                _ => Arbitration::Fresh,
            }
        }
    };
    if verdict != Arbitration::Fresh {
        debug!("{:?} signal for {} arbitrated as {:?}", signal.origin, signal.mac, verdict);
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(origin: Origin, secs: Option<i64>) -> RawSignal {
        RawSignal {
            mac: "00:00:00:00:00:01".parse().unwrap(),
            timestamp: secs.map(Timestamp::from_secs),
            wired: Some(false),
            ssid: Some("ssid".into()),
            origin,
        }
    }

    #[test]
    fn test_poll_freshness() {
        let mut state = SourceState::seeded(Some(Timestamp::from_secs(100)));
        assert_eq!(arbitrate(&state, &signal(Origin::Poll, Some(100))), Arbitration::Stale);
        assert_eq!(arbitrate(&state, &signal(Origin::Poll, Some(99))), Arbitration::Stale);
        assert_eq!(arbitrate(&state, &signal(Origin::Poll, None)), Arbitration::Undated);

        let fresh = signal(Origin::Poll, Some(101));
        assert_eq!(arbitrate(&state, &fresh), Arbitration::Fresh);
        state.record(&fresh);
        assert!(state.has_polled());
        assert_eq!(state.last_poll(), Some(Timestamp::from_secs(101)));
    }

    #[test]
    fn test_events_before_and_after_poll() {
        let mut state = SourceState::seeded(Some(Timestamp::from_secs(100)));
        assert!(!state.has_polled());

        let connect = signal(Origin::EventConnect, Some(2000));
        assert_eq!(arbitrate(&state, &connect), Arbitration::Fresh);
        state.record(&connect);

        // An older disconnect still counts; only the same kind is compared.
        let disconnect = signal(Origin::EventDisconnect, Some(1500));
        assert_eq!(arbitrate(&state, &disconnect), Arbitration::Fresh);
        state.record(&disconnect);
        assert_eq!(arbitrate(&state, &disconnect), Arbitration::Stale);

        // Events never predate polled data.
        assert_eq!(
            arbitrate(&state, &signal(Origin::EventConnect, Some(50))),
            Arbitration::Stale
        );

        state.record(&signal(Origin::Poll, Some(3000)));
        assert_eq!(
            arbitrate(&state, &signal(Origin::EventDisconnect, Some(4000))),
            Arbitration::IgnoredAfterPoll
        );
        assert_eq!(
            arbitrate(&state, &signal(Origin::EventConnect, Some(4000))),
            Arbitration::IgnoredAfterPoll
        );
    }

    #[test]
    fn test_undated_poll_still_counts_as_polled() {
        let mut state = SourceState::default();
        state.record(&signal(Origin::Poll, None));
        assert_eq!(
            arbitrate(&state, &signal(Origin::EventConnect, Some(1))),
            Arbitration::IgnoredAfterPoll
        );
    }
}
