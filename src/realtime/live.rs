use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::feed::{ChangeEvent, ChangeFilter, ChangeKind, ResourceKey};
use super::manager::{ChangeHandler, ChannelManager, ConnectionState};
use crate::attendance::{ActiveSession, AttendanceRecord, ClassSession, DeletedRecord, LiveRoster, RemoteChange, RosterChange};
use crate::error::{AppError, AppResult};

pub const ATTENDANCE_TABLE: &str = "attendance";
pub const SESSIONS_TABLE: &str = "sessions";

const NOTICE_CAPACITY: usize = 32;

/// Published when a new session appears in a watched course.
#[derive(Debug, Clone, PartialEq)]
pub struct CourseNotice {
    pub course_id: String,
    pub session: ClassSession,
}

impl CourseNotice {
    pub fn message(&self) -> String {
        format!("New session created: {}", self.session.session_name.as_deref().unwrap_or("Session"))
    }
}

/// Map an attendance-table change onto the roster's remote-change vocabulary.
pub fn attendance_change(ev: &ChangeEvent) -> AppResult<RemoteChange> {
    match ev.kind {
        ChangeKind::Insert | ChangeKind::Update => Ok(RemoteChange::Upsert(ev.decode_new::<AttendanceRecord>()?)),
        ChangeKind::Delete => Ok(RemoteChange::Delete(ev.decode_old::<DeletedRecord>()?)),
    }
}

pub fn attendance_handler(roster: LiveRoster) -> ChangeHandler {
    Arc::new(move |ev: &ChangeEvent| match attendance_change(ev) {
        Ok(change) => {
            let outcome = roster.apply_remote(change);
            if outcome == RosterChange::Stale {
                debug!(target: "realtime", kind = ?ev.kind, "dropping stale attendance change");
            }
        }
        Err(e) => warn!(target: "realtime", kind = ?ev.kind, "unreadable attendance change: {}", e),
    })
}

/// Session-row updates replace the active session; going inactive stops scans.
pub fn session_status_handler(active: ActiveSession) -> ChangeHandler {
    Arc::new(move |ev: &ChangeEvent| {
        if ev.kind != ChangeKind::Update { return; }
        match ev.decode_new::<ClassSession>() {
            Ok(session) => {
                let closing = !session.is_active;
                if active.update_if_current(session) && closing {
                    info!(target: "realtime", "active session closed remotely; scans will be rejected");
                }
            }
            Err(e) => warn!(target: "realtime", "unreadable session change: {}", e),
        }
    })
}

pub fn course_handler(course_id: String, notices: broadcast::Sender<CourseNotice>) -> ChangeHandler {
    Arc::new(move |ev: &ChangeEvent| {
        if ev.kind != ChangeKind::Insert { return; }
        match ev.decode_new::<ClassSession>() {
            Ok(session) => {
                let notice = CourseNotice { course_id: course_id.clone(), session };
                info!(target: "realtime", course = %notice.course_id, "{}", notice.message());
                let _ = notices.send(notice);
            }
            Err(e) => warn!(target: "realtime", "unreadable course change: {}", e),
        }
    })
}

/// The live views fed by channels: attendance roster, session status, course notices.
#[derive(Clone)]
pub struct LiveViews {
    channels: ChannelManager,
    roster: LiveRoster,
    active: ActiveSession,
    notices: broadcast::Sender<CourseNotice>,
}

impl LiveViews {
    pub fn new(channels: ChannelManager, roster: LiveRoster, active: ActiveSession) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { channels, roster, active, notices }
    }

    pub fn channels(&self) -> &ChannelManager { &self.channels }
    pub fn roster(&self) -> &LiveRoster { &self.roster }
    pub fn active_session(&self) -> &ActiveSession { &self.active }
    pub fn course_notices(&self) -> broadcast::Receiver<CourseNotice> { self.notices.subscribe() }

    pub async fn subscribe_to_attendance(&self, session_id: &str) -> AppResult<ConnectionState> {
        let session_id = required(session_id, "session")?;
        self.channels
            .subscribe(
                ResourceKey::attendance(session_id),
                ChangeFilter::eq(ATTENDANCE_TABLE, "session_id", session_id),
                attendance_handler(self.roster.clone()),
            )
            .await
    }

    pub async fn subscribe_to_session_status(&self, session_id: &str) -> AppResult<ConnectionState> {
        let session_id = required(session_id, "session")?;
        self.channels
            .subscribe(
                ResourceKey::session_status(session_id),
                ChangeFilter::eq(SESSIONS_TABLE, "session_id", session_id),
                session_status_handler(self.active.clone()),
            )
            .await
    }

    pub async fn subscribe_to_course_updates(&self, course_id: &str) -> AppResult<ConnectionState> {
        let course_id = required(course_id, "course")?;
        self.channels
            .subscribe(
                ResourceKey::course_sessions(course_id),
                ChangeFilter::eq(SESSIONS_TABLE, "course_id", course_id),
                course_handler(course_id.to_string(), self.notices.clone()),
            )
            .await
    }
}

fn required<'a>(id: &'a str, what: &str) -> AppResult<&'a str> {
    let id = id.trim();
    if id.is_empty() {
        return Err(AppError::user(format!("missing_{}_id", what), format!("a {} id is required", what)));
    }
    Ok(id)
}
