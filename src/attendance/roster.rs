//! In-memory attendance projection.
//! Records converge per `(student_id, session_id)` with last-timestamp-wins;
//! roster entries are derived from the records plus the enrolled students.
//! Writers: the scan pipeline (local, optimistic) and the attendance channel
//! (remote, confirmed).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use super::record::{AttendanceRecord, DeletedRecord};

type PairKey = (String, String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub student_id: String,
    pub present: bool,
    pub marked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterChange {
    /// Stored state changed.
    Applied,
    /// Same state already stored (e.g. an echo of our own write).
    Unchanged,
    /// Older than what is stored; dropped.
    Stale,
    /// Nothing to act on (delete of an unknown or superseded row).
    Ignored,
}

impl RosterChange {
    pub fn changed(self) -> bool { self == RosterChange::Applied }
}

/// Confirmed change coming from the attendance channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Upsert(AttendanceRecord),
    Delete(DeletedRecord),
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    records: BTreeMap<PairKey, AttendanceRecord>,
    enrolled: BTreeMap<String, BTreeSet<String>>,
}

impl Roster {
    pub fn from_snapshot(records: impl IntoIterator<Item = AttendanceRecord>) -> Self {
        let mut roster = Roster::default();
        for r in records {
            roster.upsert(r);
        }
        roster
    }

    pub fn enroll<I, S>(&mut self, session_id: &str, students: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enrolled.entry(session_id.to_string()).or_default().extend(students.into_iter().map(Into::into));
    }

    pub fn upsert(&mut self, record: AttendanceRecord) -> RosterChange {
        let key = (record.student_id.clone(), record.session_id.clone());
        match self.records.get_mut(&key) {
            None => {
                self.records.insert(key, record);
                RosterChange::Applied
            }
            Some(cur) if record.timestamp < cur.timestamp => RosterChange::Stale,
            Some(cur) if cur.same_state(&record) => {
                // Echo: keep the backend's row id so later deletes by id still match.
                cur.id = record.id;
                RosterChange::Unchanged
            }
            Some(cur) => {
                *cur = record;
                RosterChange::Applied
            }
        }
    }

    /// Remove the record with row id `id`, if it is still the stored one.
    pub fn remove(&mut self, deleted: &DeletedRecord) -> RosterChange {
        let found = match (&deleted.student_id, &deleted.session_id) {
            (Some(st), Some(se)) => {
                let key = (st.clone(), se.clone());
                self.records.get(&key).filter(|r| r.id == deleted.id).map(|_| key)
            }
            _ => self.records.iter().find(|(_, r)| r.id == deleted.id).map(|(k, _)| k.clone()),
        };
        match found {
            Some(key) => {
                self.records.remove(&key);
                RosterChange::Applied
            }
            None => RosterChange::Ignored,
        }
    }

    pub fn record(&self, student_id: &str, session_id: &str) -> Option<&AttendanceRecord> {
        self.records.get(&(student_id.to_string(), session_id.to_string()))
    }

    pub fn records(&self) -> impl Iterator<Item = &AttendanceRecord> { self.records.values() }

    pub fn records_for(&self, session_id: &str) -> Vec<&AttendanceRecord> {
        self.records.values().filter(|r| r.session_id == session_id).collect()
    }

    pub fn entry(&self, student_id: &str, session_id: &str) -> RosterEntry {
        let rec = self.record(student_id, session_id);
        RosterEntry {
            student_id: student_id.to_string(),
            present: rec.map(|r| r.status.counts_present()).unwrap_or(false),
            marked_at: rec.map(|r| r.timestamp),
        }
    }

    /// One line per enrolled student plus any student with a record, sorted by id.
    pub fn entries(&self, session_id: &str) -> Vec<RosterEntry> {
        let mut students: BTreeSet<&str> =
            self.enrolled.get(session_id).map(|s| s.iter().map(String::as_str).collect()).unwrap_or_default();
        students.extend(self.records_for(session_id).into_iter().map(|r| r.student_id.as_str()));
        students.into_iter().map(|s| self.entry(s, session_id)).collect()
    }

    pub fn present_count(&self, session_id: &str) -> usize {
        self.records_for(session_id).into_iter().filter(|r| r.status.counts_present()).count()
    }

    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }
}

/// Shared, observable roster. Every applied change bumps the version channel.
#[derive(Clone)]
pub struct LiveRoster {
    roster: Arc<RwLock<Roster>>,
    last_update: Arc<RwLock<Option<DateTime<Utc>>>>,
    version: watch::Sender<u64>,
}

impl Default for LiveRoster {
    fn default() -> Self { Self::new() }
}

impl LiveRoster {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self { roster: Arc::new(RwLock::new(Roster::default())), last_update: Arc::new(RwLock::new(None)), version }
    }

    /// Replace everything with a fetched snapshot.
    pub fn reset(&self, roster: Roster) {
        *self.roster.write() = roster;
        self.bump();
    }

    pub fn enroll(&self, session_id: &str, students: Vec<String>) {
        self.roster.write().enroll(session_id, students);
        self.bump();
    }

    /// Optimistic write. Returns the outcome and the record it displaced, for rollback.
    pub fn apply_local(&self, record: AttendanceRecord) -> (RosterChange, Option<AttendanceRecord>) {
        let (change, previous) = {
            let mut roster = self.roster.write();
            let previous = roster.record(&record.student_id, &record.session_id).cloned();
            (roster.upsert(record), previous)
        };
        if change.changed() { self.bump(); }
        (change, previous)
    }

    /// Undo an optimistic write, but only while `applied` is still the stored
    /// state for its pair. A newer remote change is never clobbered.
    pub fn revert_local(&self, applied: &AttendanceRecord, previous: Option<AttendanceRecord>) -> bool {
        let reverted = {
            let mut roster = self.roster.write();
            let key = (applied.student_id.clone(), applied.session_id.clone());
            let still_ours = roster.records.get(&key).map(|r| r.id == applied.id && r.same_state(applied)).unwrap_or(false);
            if still_ours {
                match previous {
                    Some(p) => { roster.records.insert(key, p); }
                    None => { roster.records.remove(&key); }
                }
            }
            still_ours
        };
        if reverted { self.bump(); }
        reverted
    }

    /// Record the backend's copy of an optimistic write (adopts its row id).
    pub fn confirm_local(&self, stored: AttendanceRecord) -> RosterChange {
        let outcome = self.roster.write().upsert(stored);
        if outcome.changed() { self.bump(); }
        outcome
    }

    pub fn apply_remote(&self, change: RemoteChange) -> RosterChange {
        let outcome = {
            let mut roster = self.roster.write();
            match change {
                RemoteChange::Upsert(r) => roster.upsert(r),
                RemoteChange::Delete(d) => roster.remove(&d),
            }
        };
        *self.last_update.write() = Some(Utc::now());
        if outcome.changed() { self.bump(); }
        outcome
    }

    pub fn snapshot(&self) -> Roster { self.roster.read().clone() }
    pub fn entries(&self, session_id: &str) -> Vec<RosterEntry> { self.roster.read().entries(session_id) }
    pub fn entry(&self, student_id: &str, session_id: &str) -> RosterEntry { self.roster.read().entry(student_id, session_id) }
    pub fn present_count(&self, session_id: &str) -> usize { self.roster.read().present_count(session_id) }
    pub fn record(&self, student_id: &str, session_id: &str) -> Option<AttendanceRecord> {
        self.roster.read().record(student_id, session_id).cloned()
    }
    pub fn len(&self) -> usize { self.roster.read().len() }
    pub fn is_empty(&self) -> bool { self.roster.read().is_empty() }

    /// When the last remote change arrived.
    pub fn last_update(&self) -> Option<DateTime<Utc>> { *self.last_update.read() }

    pub fn watch(&self) -> watch::Receiver<u64> { self.version.subscribe() }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

#[cfg(test)]
#[path = "roster_tests.rs"]
mod roster_tests;
