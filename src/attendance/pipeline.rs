//! Detection -> attendance mutation.
//! Per detection: validate, cooldown, announce, check the active session,
//! resolve the student, apply optimistically, write, roll back on failure.
//! Every failure is reported as a `ScanError` and scanning carries on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::cooldown::Cooldown;
use super::record::{ActiveSession, AttendanceRecord};
use super::roster::{LiveRoster, RosterChange};
use super::scanner::{Detection, Scanner};
use super::store::{AttendanceStore, StudentDirectory};
use crate::error::ScanError;
use crate::tprintln;

static CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\x21-\x7E]{1,64}$").unwrap());

const EVENT_CAPACITY: usize = 64;

/// Outward notifications, in the order they happen for one detection.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// A detection passed validation and cooldown.
    Detected { code: String, at: DateTime<Utc> },
    Marked(AttendanceRecord),
    Failed { code: String, error: ScanError },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Marked(AttendanceRecord),
    /// Repeat inside the cooldown window; dropped silently.
    Suppressed,
    /// Scanner is idle or paused.
    NotScanning,
    /// A newer record for the pair already exists; nothing was written.
    Superseded(AttendanceRecord),
    Rejected(ScanError),
}

impl ScanOutcome {
    pub fn error(&self) -> Option<&ScanError> {
        match self {
            ScanOutcome::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

pub fn validate_code(raw: &str) -> Result<&str, ScanError> {
    let code = raw.trim();
    if CODE_RE.is_match(code) { Ok(code) } else { Err(ScanError::InvalidCode) }
}

pub struct ScanPipeline {
    scanner: Scanner,
    cooldown: Mutex<Cooldown>,
    active: ActiveSession,
    roster: LiveRoster,
    store: Arc<dyn AttendanceStore>,
    directory: Arc<dyn StudentDirectory>,
    events: broadcast::Sender<ScanEvent>,
}

impl ScanPipeline {
    pub fn new(
        scanner: Scanner,
        active: ActiveSession,
        roster: LiveRoster,
        store: Arc<dyn AttendanceStore>,
        directory: Arc<dyn StudentDirectory>,
        cooldown: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { scanner, cooldown: Mutex::new(Cooldown::new(cooldown)), active, roster, store, directory, events }
    }

    pub fn scanner(&self) -> &Scanner { &self.scanner }
    pub fn roster(&self) -> &LiveRoster { &self.roster }
    pub fn active_session(&self) -> &ActiveSession { &self.active }
    pub fn events(&self) -> broadcast::Receiver<ScanEvent> { self.events.subscribe() }

    /// Load the stored attendance and enrolment for `session_id` into the roster.
    pub async fn load_roster(&self, session_id: &str) -> Result<usize, ScanError> {
        let records = self.store.attendance_for_session(session_id).await.map_err(|e| ScanError::from_backend(&e))?;
        let students = self.directory.roster_for_session(session_id).await.map_err(|e| ScanError::from_backend(&e))?;
        let mut roster = self.roster.snapshot();
        let n = records.len();
        for r in records {
            roster.upsert(r);
        }
        roster.enroll(session_id, students);
        self.roster.reset(roster);
        info!(target: "scan", session = session_id, records = n, "roster loaded");
        Ok(n)
    }

    pub async fn handle_detection(&self, detection: Detection) -> ScanOutcome {
        if !self.scanner.is_scanning() {
            debug!(target: "scan", code = %detection.code, "detection while not scanning; ignored");
            return ScanOutcome::NotScanning;
        }
        let code = match validate_code(&detection.code) {
            Ok(c) => c.to_string(),
            Err(e) => return self.reject(&detection.code, e),
        };
        if !self.cooldown.lock().admit(&code, detection.timestamp) {
            tprintln!("scan.suppressed code={}", code);
            return ScanOutcome::Suppressed;
        }
        let _ = self.events.send(ScanEvent::Detected { code: code.clone(), at: detection.timestamp });

        let Some(session_id) = self.active.accepting() else {
            return self.reject(&code, ScanError::NoActiveSession);
        };
        let student_id = match self.directory.resolve_code(&code).await {
            Ok(Some(id)) => id,
            Ok(None) => return self.reject(&code, ScanError::UnknownCode(code.clone())),
            Err(e) => return self.reject(&code, ScanError::from_backend(&e)),
        };

        let record = AttendanceRecord::present(&student_id, &session_id, detection.timestamp);
        let (change, previous) = self.roster.apply_local(record.clone());
        debug!(target: "scan", student = %student_id, session = %session_id, ?change, "optimistic roster update");
        if change == RosterChange::Stale {
            return self.superseded(previous.unwrap_or(record));
        }

        match self.store.record_attendance(&record).await {
            Ok(stored) if stored.same_state(&record) => {
                // Adopt the stored row id; a no-op if the echo already did.
                self.roster.confirm_local(stored.clone());
                info!(target: "scan", student = %student_id, session = %session_id, "attendance marked");
                let _ = self.events.send(ScanEvent::Marked(stored.clone()));
                ScanOutcome::Marked(stored)
            }
            Ok(newer) => {
                // Backend kept a later row; it replaces the optimistic one.
                self.roster.confirm_local(newer.clone());
                self.superseded(newer)
            }
            Err(e) => {
                if change == RosterChange::Applied && !self.roster.revert_local(&record, previous) {
                    debug!(target: "scan", student = %student_id, "optimistic update superseded; nothing to roll back");
                }
                self.reject(&code, ScanError::from_backend(&e))
            }
        }
    }

    /// Drive the pipeline from a detection stream. The stream closing means
    /// the scanning surface went away; the scanner returns to idle.
    pub async fn run(&self, mut detections: mpsc::Receiver<Detection>) {
        while let Some(d) = detections.recv().await {
            let outcome = self.handle_detection(d).await;
            tprintln!("scan.outcome {:?}", outcome);
        }
        info!(target: "scan", "detection stream closed; stopping scanner");
        self.scanner.stop();
    }

    fn superseded(&self, current: AttendanceRecord) -> ScanOutcome {
        info!(
            target: "scan",
            student = %current.student_id,
            session = %current.session_id,
            kept = %current.timestamp,
            "newer attendance already recorded; scan not written"
        );
        ScanOutcome::Superseded(current)
    }

    fn reject(&self, code: &str, error: ScanError) -> ScanOutcome {
        warn!(target: "scan", code, error = error.code_str(), "{}", error);
        let _ = self.events.send(ScanEvent::Failed { code: code.to_string(), error: error.clone() });
        ScanOutcome::Rejected(error)
    }
}
