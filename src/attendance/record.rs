use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
    Excused,
}

impl AttendanceStatus {
    pub fn counts_present(self) -> bool { matches!(self, AttendanceStatus::Present | AttendanceStatus::Late) }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Late => "Late",
            AttendanceStatus::Absent => "Absent",
            AttendanceStatus::Excused => "Excused",
        };
        f.write_str(s)
    }
}

/// One row of the `attendance` table. Converges to a single state per
/// `(student_id, session_id)`; the later `timestamp` wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub session_id: String,
    pub status: AttendanceStatus,
    pub timestamp: DateTime<Utc>,
}

impl AttendanceRecord {
    pub fn present(student_id: &str, session_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            student_id: student_id.to_string(),
            session_id: session_id.to_string(),
            status: AttendanceStatus::Present,
            timestamp: at,
        }
    }

    pub fn key(&self) -> (&str, &str) { (&self.student_id, &self.session_id) }

    /// Same state modulo the row id, as when the backend echoes our own write.
    pub fn same_state(&self, other: &AttendanceRecord) -> bool {
        self.key() == other.key() && self.status == other.status && self.timestamp == other.timestamp
    }
}

/// Old row of a DELETE event. Backends may send only the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRecord {
    pub id: String,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Row of the `sessions` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSession {
    pub session_id: String,
    pub course_id: String,
    #[serde(default)]
    pub session_name: Option<String>,
    pub is_active: bool,
}

/// The session attendance is currently recorded against. Shared between the
/// pipeline and the session-status channel.
#[derive(Clone)]
pub struct ActiveSession {
    tx: watch::Sender<Option<ClassSession>>,
}

impl Default for ActiveSession {
    fn default() -> Self { Self::new() }
}

impl ActiveSession {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn set(&self, session: Option<ClassSession>) {
        self.tx.send_if_modified(|s| {
            if *s == session { return false; }
            *s = session;
            true
        });
    }

    /// Replace the session only if it is the one currently set.
    pub fn update_if_current(&self, session: ClassSession) -> bool {
        self.tx.send_if_modified(|s| match s {
            Some(cur) if cur.session_id == session.session_id && *cur != session => {
                *cur = session;
                true
            }
            _ => false,
        })
    }

    pub fn current(&self) -> Option<ClassSession> { self.tx.borrow().clone() }

    /// Id of the current session if it accepts attendance.
    pub fn accepting(&self) -> Option<String> {
        self.tx.borrow().as_ref().filter(|s| s.is_active).map(|s| s.session_id.clone())
    }

    pub fn watch(&self) -> watch::Receiver<Option<ClassSession>> { self.tx.subscribe() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_and_late_count() {
        assert!(AttendanceStatus::Present.counts_present());
        assert!(AttendanceStatus::Late.counts_present());
        assert!(!AttendanceStatus::Absent.counts_present());
        assert!(!AttendanceStatus::Excused.counts_present());
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(serde_json::to_string(&AttendanceStatus::Late).unwrap(), "\"Late\"");
        let s: AttendanceStatus = serde_json::from_str("\"Excused\"").unwrap();
        assert_eq!(s, AttendanceStatus::Excused);
    }

    #[test]
    fn inactive_session_does_not_accept() {
        let active = ActiveSession::new();
        assert_eq!(active.accepting(), None);
        let mut s = ClassSession { session_id: "T".into(), course_id: "C".into(), session_name: None, is_active: true };
        active.set(Some(s.clone()));
        assert_eq!(active.accepting().as_deref(), Some("T"));
        s.is_active = false;
        assert!(active.update_if_current(s.clone()));
        assert_eq!(active.accepting(), None);
        let other = ClassSession { session_id: "U".into(), ..s };
        assert!(!active.update_if_current(other));
        assert_eq!(active.current().unwrap().session_id, "T");
    }
}
