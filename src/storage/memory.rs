//! In-process backend: auth, profile tables, attendance, sessions and a change
//! feed, all behind one `parking_lot` mutex. Writes are echoed to every open
//! channel whose filter matches, the way the hosted backend does. Faults can be
//! injected at runtime and every collaborator call is counted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use super::seed::MemorySeed;
use crate::attendance::{AttendanceRecord, AttendanceStore, ClassSession, StudentDirectory};
use crate::error::{AppError, AppResult};
use crate::identity::{AuthProvider, Identity, IdentityEvent, IdentityEventKind, Profile, ProfileStore, ProfileTable, SignUpRequest};
use crate::realtime::{ChangeEvent, ChangeFeed, ChangeFilter, ChannelHandle, ChannelStatus, FeedMessage, FeedReceiver, ResourceKey, ATTENDANCE_TABLE, SESSIONS_TABLE};
use crate::security::{gen_token, hash_password, verify_password};

const IDENTITY_EVENT_CAPACITY: usize = 64;

struct UserRow {
    identity: Identity,
    password_hash: String,
}

struct OpenChannel {
    key: ResourceKey,
    filter: ChangeFilter,
    tx: mpsc::UnboundedSender<FeedMessage>,
}

#[derive(Default)]
struct State {
    /// Keyed by lowercased email.
    users: HashMap<String, UserRow>,
    /// (user id, access token)
    current: Option<(String, String)>,
    students: BTreeMap<String, Profile>,
    teachers: BTreeMap<String, Profile>,
    sessions: BTreeMap<String, ClassSession>,
    enrolments: HashMap<String, BTreeSet<String>>,
    attendance: BTreeMap<(String, String), AttendanceRecord>,
    channels: HashMap<u64, OpenChannel>,
}

impl State {
    fn table(&self, table: ProfileTable) -> &BTreeMap<String, Profile> {
        match table {
            ProfileTable::Students => &self.students,
            ProfileTable::Teachers => &self.teachers,
        }
    }

    fn table_mut(&mut self, table: ProfileTable) -> &mut BTreeMap<String, Profile> {
        match table {
            ProfileTable::Students => &mut self.students,
            ProfileTable::Teachers => &mut self.teachers,
        }
    }

    fn user_by_id_mut(&mut self, id: &str) -> Option<&mut UserRow> {
        self.users.values_mut().find(|u| u.identity.id == id)
    }

    fn current_identity(&self) -> Option<Identity> {
        let (id, _) = self.current.as_ref()?;
        self.users.values().find(|u| &u.identity.id == id).map(|u| u.identity.clone())
    }

    /// Push `ev` to every open channel that selects it.
    fn echo(&self, ev: &ChangeEvent) {
        for ch in self.channels.values() {
            if ch.filter.matches_event(ev) {
                debug!(target: "backend", channel = %ch.key, kind = ?ev.kind, "echo change");
                let _ = ch.tx.send(FeedMessage::Change(ev.clone()));
            }
        }
    }
}

/// Injectable failures. All flags can be flipped while the backend is in use.
#[derive(Debug, Default)]
struct Faults {
    offline: AtomicBool,
    identity_delay_ms: AtomicU64,
    fail_channels: AtomicBool,
    silent_channels: AtomicBool,
    fail_profile_writes: AtomicBool,
    fail_attendance_writes: AtomicBool,
}

/// Snapshot of collaborator call counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub current_identity: usize,
    pub sign_in: usize,
    pub sign_out: usize,
    pub update_role_metadata: usize,
    pub find_profile: usize,
    pub insert_profile: usize,
    pub upsert_students: usize,
    pub upsert_teachers: usize,
    pub record_attendance: usize,
    pub resolve_code: usize,
    pub open_channel: usize,
    pub close_channel: usize,
}

#[derive(Default)]
struct Counters {
    current_identity: AtomicUsize,
    sign_in: AtomicUsize,
    sign_out: AtomicUsize,
    update_role_metadata: AtomicUsize,
    find_profile: AtomicUsize,
    insert_profile: AtomicUsize,
    upsert_students: AtomicUsize,
    upsert_teachers: AtomicUsize,
    record_attendance: AtomicUsize,
    resolve_code: AtomicUsize,
    open_channel: AtomicUsize,
    close_channel: AtomicUsize,
}

fn bump(c: &AtomicUsize) { c.fetch_add(1, Ordering::SeqCst); }

pub struct MemoryBackend {
    state: Mutex<State>,
    events: broadcast::Sender<IdentityEvent>,
    faults: Faults,
    counters: Counters,
    next_channel: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self { Self::new() }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(IDENTITY_EVENT_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
            faults: Faults::default(),
            counters: Counters::default(),
            next_channel: AtomicU64::new(1),
        }
    }

    pub fn from_seed(seed: MemorySeed) -> Result<Self> {
        let backend = Self::new();
        for u in &seed.users {
            backend.add_user(u.id.as_deref(), &u.email, &u.password, u.role.as_deref(), u.metadata.clone())?;
        }
        {
            let mut st = backend.state.lock();
            for p in seed.students {
                st.students.insert(p.id.clone(), p);
            }
            for p in seed.teachers {
                st.teachers.insert(p.id.clone(), p);
            }
            for s in seed.sessions {
                st.sessions.insert(s.session_id.clone(), s);
            }
            for (session, students) in seed.enrolments {
                st.enrolments.entry(session).or_default().extend(students);
            }
            for r in seed.attendance {
                st.attendance.insert((r.student_id.clone(), r.session_id.clone()), r);
            }
            if let Some(email) = seed.signed_in {
                let id = st.users.get(&email.to_lowercase()).map(|u| u.identity.id.clone());
                match id {
                    Some(id) => st.current = Some((id, gen_token()?)),
                    None => anyhow::bail!("seed signed_in '{}' is not a seeded user", email),
                }
            }
            info!(
                target: "backend",
                users = st.users.len(),
                students = st.students.len(),
                teachers = st.teachers.len(),
                sessions = st.sessions.len(),
                "memory backend seeded"
            );
        }
        Ok(backend)
    }

    pub fn from_seed_file(path: &Path) -> Result<Self> {
        Self::from_seed(MemorySeed::from_json_file(path)?)
    }

    /// Create an auth account directly, bypassing sign-up validation.
    pub fn add_user(
        &self,
        id: Option<&str>,
        email: &str,
        password: &str,
        raw_role: Option<&str>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Identity> {
        let id = id.map(str::to_string).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut identity = Identity::new(id, email, raw_role);
        identity.metadata = metadata;
        let password_hash = hash_password(password)?;
        let mut st = self.state.lock();
        if st.users.contains_key(&email.to_lowercase()) {
            anyhow::bail!("duplicate user {}", email);
        }
        st.users.insert(email.to_lowercase(), UserRow { identity: identity.clone(), password_hash });
        Ok(identity)
    }

    pub fn set_offline(&self, on: bool) { self.faults.offline.store(on, Ordering::SeqCst); }
    pub fn set_identity_delay(&self, delay: Duration) {
        self.faults.identity_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
    /// Channels open but report `Errored` instead of `Subscribed`.
    pub fn set_fail_channels(&self, on: bool) { self.faults.fail_channels.store(on, Ordering::SeqCst); }
    /// Channels open but never report a status.
    pub fn set_silent_channels(&self, on: bool) { self.faults.silent_channels.store(on, Ordering::SeqCst); }
    pub fn set_fail_profile_writes(&self, on: bool) { self.faults.fail_profile_writes.store(on, Ordering::SeqCst); }
    pub fn set_fail_attendance_writes(&self, on: bool) { self.faults.fail_attendance_writes.store(on, Ordering::SeqCst); }

    pub fn calls(&self) -> CallCounts {
        let c = &self.counters;
        let get = |a: &AtomicUsize| a.load(Ordering::SeqCst);
        CallCounts {
            current_identity: get(&c.current_identity),
            sign_in: get(&c.sign_in),
            sign_out: get(&c.sign_out),
            update_role_metadata: get(&c.update_role_metadata),
            find_profile: get(&c.find_profile),
            insert_profile: get(&c.insert_profile),
            upsert_students: get(&c.upsert_students),
            upsert_teachers: get(&c.upsert_teachers),
            record_attendance: get(&c.record_attendance),
            resolve_code: get(&c.resolve_code),
            open_channel: get(&c.open_channel),
            close_channel: get(&c.close_channel),
        }
    }

    pub fn profile(&self, table: ProfileTable, id: &str) -> Option<Profile> { self.state.lock().table(table).get(id).cloned() }
    pub fn profile_count(&self, table: ProfileTable) -> usize { self.state.lock().table(table).len() }
    pub fn identity_by_email(&self, email: &str) -> Option<Identity> {
        self.state.lock().users.get(&email.to_lowercase()).map(|u| u.identity.clone())
    }
    pub fn attendance_row(&self, student_id: &str, session_id: &str) -> Option<AttendanceRecord> {
        self.state.lock().attendance.get(&(student_id.to_string(), session_id.to_string())).cloned()
    }
    pub fn session(&self, session_id: &str) -> Option<ClassSession> { self.state.lock().sessions.get(session_id).cloned() }
    pub fn first_active_session(&self) -> Option<String> {
        self.state.lock().sessions.values().find(|s| s.is_active).map(|s| s.session_id.clone())
    }
    pub fn open_channel_count(&self) -> usize { self.state.lock().channels.len() }
    pub fn open_channel_keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self.state.lock().channels.values().map(|c| c.key.clone()).collect();
        keys.sort();
        keys
    }

    /// Insert a session row (echoed as INSERT on `sessions`).
    pub fn create_session(&self, session: ClassSession) {
        let mut st = self.state.lock();
        let row = json!(session);
        st.sessions.insert(session.session_id.clone(), session);
        st.echo(&ChangeEvent::insert(SESSIONS_TABLE, row));
    }

    /// Flip a session's active flag (echoed as UPDATE on `sessions`).
    pub fn set_session_active(&self, session_id: &str, active: bool) -> AppResult<ClassSession> {
        let mut st = self.state.lock();
        let session = st
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::not_found("session_not_found".to_string(), format!("no session {}", session_id)))?;
        let old = json!(session);
        session.is_active = active;
        let updated = session.clone();
        st.echo(&ChangeEvent::update(SESSIONS_TABLE, json!(updated), Some(old)));
        Ok(updated)
    }

    pub fn enroll(&self, session_id: &str, student_id: &str) {
        self.state.lock().enrolments.entry(session_id.to_string()).or_default().insert(student_id.to_string());
    }

    /// Delete an attendance row (echoed as DELETE with the old row).
    pub fn delete_attendance(&self, student_id: &str, session_id: &str) -> Option<AttendanceRecord> {
        let mut st = self.state.lock();
        let removed = st.attendance.remove(&(student_id.to_string(), session_id.to_string()))?;
        st.echo(&ChangeEvent::delete(ATTENDANCE_TABLE, json!(removed)));
        Some(removed)
    }

    /// Deliver an arbitrary change to matching channels without touching stored rows.
    pub fn emit_change(&self, ev: ChangeEvent) {
        self.state.lock().echo(&ev);
    }

    /// Drop every channel from the backend side, as on a lost connection.
    pub fn drop_channels(&self) {
        let dropped = std::mem::take(&mut self.state.lock().channels);
        info!(target: "backend", count = dropped.len(), "dropping all channels");
    }

    fn check_online(&self) -> AppResult<()> {
        if self.faults.offline.load(Ordering::SeqCst) {
            return Err(AppError::io("network_unavailable", "backend unreachable"));
        }
        Ok(())
    }

    fn emit(&self, kind: IdentityEventKind, identity: Option<Identity>) {
        let _ = self.events.send(IdentityEvent { kind, identity });
    }
}

#[async_trait]
impl AuthProvider for MemoryBackend {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> AppResult<Identity> {
        bump(&self.counters.sign_in);
        self.check_online()?;
        let identity = {
            let mut st = self.state.lock();
            let user = st
                .users
                .get(&email.to_lowercase())
                .filter(|u| verify_password(&u.password_hash, password))
                .ok_or_else(|| AppError::auth("invalid_credentials", "Invalid login credentials"))?;
            let identity = user.identity.clone();
            st.current = Some((identity.id.clone(), gen_token()?));
            identity
        };
        self.emit(IdentityEventKind::SignedIn, Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_up(&self, req: &SignUpRequest) -> AppResult<Identity> {
        self.check_online()?;
        if self.state.lock().users.contains_key(&req.email.to_lowercase()) {
            return Err(AppError::conflict("email_taken", "User already registered"));
        }
        self.add_user(None, &req.email, &req.password, Some(req.role.as_str()), req.metadata())
            .map_err(|e| AppError::internal("sign_up_failed".to_string(), e.to_string()))
    }

    async fn sign_out(&self) -> AppResult<()> {
        bump(&self.counters.sign_out);
        self.check_online()?;
        let was = self.state.lock().current.take();
        if was.is_some() {
            self.emit(IdentityEventKind::SignedOut, None);
        }
        Ok(())
    }

    async fn current_identity(&self) -> AppResult<Option<Identity>> {
        bump(&self.counters.current_identity);
        let delay = self.faults.identity_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_online()?;
        Ok(self.state.lock().current_identity())
    }

    async fn update_role_metadata(&self, user_id: &str, role: &str) -> AppResult<Identity> {
        bump(&self.counters.update_role_metadata);
        self.check_online()?;
        let (identity, is_current) = {
            let mut st = self.state.lock();
            let is_current = st.current.as_ref().map(|(id, _)| id == user_id).unwrap_or(false);
            let user = st
                .user_by_id_mut(user_id)
                .ok_or_else(|| AppError::not_found("user_not_found".to_string(), format!("no user {}", user_id)))?;
            user.identity.raw_role = Some(role.to_string());
            user.identity.metadata.insert("role".into(), role.into());
            (user.identity.clone(), is_current)
        };
        if is_current {
            self.emit(IdentityEventKind::UserUpdated, Some(identity.clone()));
        }
        Ok(identity)
    }

    async fn reset_password(&self, email: &str) -> AppResult<()> {
        self.check_online()?;
        debug!(target: "backend", email, "password reset requested");
        Ok(())
    }

    fn on_identity_change(&self) -> broadcast::Receiver<IdentityEvent> { self.events.subscribe() }
}

#[async_trait]
impl ProfileStore for MemoryBackend {
    async fn find_profile(&self, table: ProfileTable, id: &str) -> AppResult<Option<Profile>> {
        bump(&self.counters.find_profile);
        self.check_online()?;
        Ok(self.state.lock().table(table).get(id).cloned())
    }

    async fn insert_profile(&self, table: ProfileTable, profile: &Profile) -> AppResult<Profile> {
        bump(&self.counters.insert_profile);
        self.check_online()?;
        if self.faults.fail_profile_writes.load(Ordering::SeqCst) {
            return Err(AppError::io("profile_write_failed".to_string(), format!("insert into {} rejected", table.table_name())));
        }
        let mut st = self.state.lock();
        let rows = st.table_mut(table);
        if rows.contains_key(&profile.id) || rows.values().any(|p| p.email.eq_ignore_ascii_case(&profile.email)) {
            return Err(AppError::conflict("duplicate_profile".to_string(), format!("{} already has {}", table.table_name(), profile.email)));
        }
        rows.insert(profile.id.clone(), profile.clone());
        Ok(profile.clone())
    }

    async fn upsert_profile_on_email(&self, table: ProfileTable, profile: &Profile) -> AppResult<Profile> {
        bump(match table {
            ProfileTable::Students => &self.counters.upsert_students,
            ProfileTable::Teachers => &self.counters.upsert_teachers,
        });
        self.check_online()?;
        if self.faults.fail_profile_writes.load(Ordering::SeqCst) {
            return Err(AppError::io("profile_write_failed".to_string(), format!("upsert into {} rejected", table.table_name())));
        }
        let mut st = self.state.lock();
        let rows = st.table_mut(table);
        let orphan = rows.iter().find(|(_, p)| p.email.eq_ignore_ascii_case(&profile.email)).map(|(k, _)| k.clone());
        if let Some(old_id) = orphan {
            debug!(target: "backend", table = table.table_name(), old_id = %old_id, new_id = %profile.id, "upsert replaces row with same email");
            rows.remove(&old_id);
        }
        rows.insert(profile.id.clone(), profile.clone());
        Ok(profile.clone())
    }
}

#[async_trait]
impl AttendanceStore for MemoryBackend {
    async fn record_attendance(&self, record: &AttendanceRecord) -> AppResult<AttendanceRecord> {
        bump(&self.counters.record_attendance);
        self.check_online()?;
        if self.faults.fail_attendance_writes.load(Ordering::SeqCst) {
            return Err(AppError::io("attendance_write_failed", "attendance write rejected"));
        }
        let mut st = self.state.lock();
        let key = (record.student_id.clone(), record.session_id.clone());
        let previous = st.attendance.get(&key).cloned();
        if let Some(current) = previous.as_ref().filter(|p| record.timestamp < p.timestamp) {
            debug!(target: "backend", student = %record.student_id, session = %record.session_id, "older attendance write ignored");
            return Ok(current.clone());
        }
        let stored = AttendanceRecord { id: previous.as_ref().map(|p| p.id.clone()).unwrap_or_else(|| record.id.clone()), ..record.clone() };
        st.attendance.insert(key, stored.clone());
        let ev = match previous {
            Some(old) => ChangeEvent::update(ATTENDANCE_TABLE, json!(stored), Some(json!(old))),
            None => ChangeEvent::insert(ATTENDANCE_TABLE, json!(stored)),
        };
        st.echo(&ev);
        Ok(stored)
    }

    async fn attendance_for_session(&self, session_id: &str) -> AppResult<Vec<AttendanceRecord>> {
        self.check_online()?;
        Ok(self.state.lock().attendance.values().filter(|r| r.session_id == session_id).cloned().collect())
    }
}

#[async_trait]
impl StudentDirectory for MemoryBackend {
    async fn resolve_code(&self, code: &str) -> AppResult<Option<String>> {
        bump(&self.counters.resolve_code);
        self.check_online()?;
        let st = self.state.lock();
        let hit = st
            .students
            .values()
            .find(|p| p.qr_code.as_deref() == Some(code) || p.external_id.as_deref() == Some(code))
            .map(|p| p.id.clone());
        Ok(hit)
    }

    async fn roster_for_session(&self, session_id: &str) -> AppResult<Vec<String>> {
        self.check_online()?;
        Ok(self.state.lock().enrolments.get(session_id).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn open_channel(&self, key: &ResourceKey, filter: &ChangeFilter) -> AppResult<(ChannelHandle, FeedReceiver)> {
        bump(&self.counters.open_channel);
        self.check_online()?;
        let id = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        if self.faults.fail_channels.load(Ordering::SeqCst) {
            let _ = tx.send(FeedMessage::Status(ChannelStatus::Errored("CHANNEL_ERROR".to_string())));
        } else if !self.faults.silent_channels.load(Ordering::SeqCst) {
            let _ = tx.send(FeedMessage::Status(ChannelStatus::Subscribed));
        }
        self.state.lock().channels.insert(id, OpenChannel { key: key.clone(), filter: filter.clone(), tx });
        debug!(target: "backend", channel = %key, %filter, id, "channel opened");
        Ok((ChannelHandle(id), rx))
    }

    async fn close_channel(&self, handle: ChannelHandle) -> AppResult<()> {
        bump(&self.counters.close_channel);
        if let Some(ch) = self.state.lock().channels.remove(&handle.0) {
            let _ = ch.tx.send(FeedMessage::Status(ChannelStatus::Closed));
            debug!(target: "backend", channel = %ch.key, id = handle.0, "channel closed");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod memory_tests;
