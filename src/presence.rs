//! Debounced presence tracking.
//!
//! Each configured person owns one [`PresenceRecord`]. Raw reachability
//! samples are folded into the record once per poll cycle and only produce
//! a [`PresenceEvent`] once the person has gone unseen (or been seen again)
//! for longer than the debounce period. Cycles that arrive after a long gap
//! since the previous one are treated as stale: bookkeeping continues but no
//! event can fire.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeDelta, Utc};
use log::debug;

use crate::messages::{PresenceEvent, PresenceKind};
use crate::snapshot::{PersonSnapshot, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown person: {0}")]
pub struct InvalidPersonError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    /// No sample has been folded in yet.
    Unknown,
    Home,
    Away,
}

#[derive(Debug, Clone, Copy)]
pub struct PresenceSettings {
    pub debounce: TimeDelta,
    pub staleness: TimeDelta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    /// Last reported (debounced) state.
    pub home: bool,
    /// Most recent reachable sample, `None` if never seen.
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct PresenceTracker {
    settings: PresenceSettings,
    records: HashMap<String, Option<PresenceRecord>>,
    last_cycle_at: Option<DateTime<Utc>>,
}

impl PresenceTracker {
    pub fn new<I, S>(people: I, settings: PresenceSettings) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PresenceTracker {
            settings,
            records: people.into_iter().map(|p| (p.into(), None)).collect(),
            last_cycle_at: None,
        }
    }

    /// A cycle is stale when too much time passed since the previous one, or
    /// when the clock moved backwards.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.last_cycle_at {
            Some(last) => now < last || now - last > self.settings.staleness,
            None => false,
        }
    }

    /// Fold one reachability sample for `person` into its record.
    pub fn update(
        &mut self,
        person: &str,
        reachable: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<PresenceEvent>, InvalidPersonError> {
        let stale = self.is_stale(now);
        let debounce = self.settings.debounce;

        let slot = self
            .records
            .get_mut(person)
            .ok_or_else(|| InvalidPersonError(person.to_string()))?;

        let record = match slot {
            Some(record) => record,
            None => {
                debug!("First sample for {}: reachable={}", person, reachable);
                *slot = Some(PresenceRecord {
                    home: reachable,
                    last_seen_at: reachable.then_some(now),
                });
                return Ok(None);
            }
        };

        let mut event = None;
        if stale {
            debug!("Skipping transition check for {} on stale cycle", person);
        } else {
            let past_grace = match record.last_seen_at {
                Some(seen) => now > seen + debounce,
                None => true,
            };

            let kind = match (reachable, record.home) {
                (true, false) if past_grace => Some(PresenceKind::Arrived),
                (false, true) if past_grace => Some(PresenceKind::Departed),
                _ => None,
            };

            if let Some(kind) = kind {
                record.home = kind == PresenceKind::Arrived;
                event = Some(PresenceEvent {
                    person: person.to_string(),
                    kind,
                    timestamp: now,
                });
            }
        }

        if reachable {
            record.last_seen_at = Some(now);
        }

        Ok(event)
    }

    /// Record that the cycle started at `now` has been fully processed.
    pub fn finish_cycle(&mut self, now: DateTime<Utc>) {
        self.last_cycle_at = Some(now);
    }

    pub fn last_cycle_at(&self) -> Option<DateTime<Utc>> {
        self.last_cycle_at
    }

    pub fn status(&self, person: &str) -> Result<PresenceStatus, InvalidPersonError> {
        match self.records.get(person) {
            Some(Some(record)) if record.home => Ok(PresenceStatus::Home),
            Some(Some(_)) => Ok(PresenceStatus::Away),
            Some(None) => Ok(PresenceStatus::Unknown),
            None => Err(InvalidPersonError(person.to_string())),
        }
    }

    #[cfg(test)]
    pub fn record(&self, person: &str) -> Option<&PresenceRecord> {
        self.records.get(person).and_then(Option::as_ref)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Snapshot {
        let people = self
            .records
            .iter()
            .filter_map(|(name, record)| {
                record.as_ref().map(|r| {
                    (
                        name.clone(),
                        PersonSnapshot {
                            home: r.home,
                            last_seen_at: r.last_seen_at,
                        },
                    )
                })
            })
            .collect::<BTreeMap<_, _>>();

        Snapshot {
            taken_at: now,
            last_cycle_at: self.last_cycle_at,
            people,
        }
    }

    /// Seed records from a previous run. Names no longer configured are
    /// dropped; the staleness rule decides whether the next cycle may compare
    /// against the restored state.
    pub fn restore(&mut self, snapshot: Snapshot) {
        for (name, person) in snapshot.people {
            match self.records.get_mut(&name) {
                Some(slot) => {
                    *slot = Some(PresenceRecord {
                        home: person.home,
                        last_seen_at: person.last_seen_at,
                    });
                }
                None => debug!("Ignoring snapshot entry for unconfigured person {}", name),
            }
        }
        self.last_cycle_at = snapshot.last_cycle_at;
    }
}
