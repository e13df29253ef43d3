//! Wiring for one client instance: session, reconciler, auth flows, channels,
//! live views and the scan pipeline, all sharing one set of collaborators.

use std::sync::Arc;

use crate::attendance::{ActiveSession, AttendanceStore, LiveRoster, ScanPipeline, ScanSource, Scanner, StudentDirectory};
use crate::config::RollcallConfig;
use crate::identity::{AuthProvider, AuthService, ProfileStore, RoleReconciler, SessionStore};
use crate::realtime::{ChangeFeed, ChannelManager, LiveViews};
use crate::storage::MemoryBackend;

/// The backend seams a client needs.
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthProvider>,
    pub profiles: Arc<dyn ProfileStore>,
    pub attendance: Arc<dyn AttendanceStore>,
    pub directory: Arc<dyn StudentDirectory>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl Collaborators {
    pub fn memory(backend: Arc<MemoryBackend>) -> Self {
        Self {
            auth: backend.clone(),
            profiles: backend.clone(),
            attendance: backend.clone(),
            directory: backend.clone(),
            feed: backend,
        }
    }
}

pub struct Rollcall {
    pub session: SessionStore,
    pub reconciler: Arc<RoleReconciler>,
    pub auth: AuthService,
    pub channels: ChannelManager,
    pub live: LiveViews,
    pub pipeline: Arc<ScanPipeline>,
}

impl Rollcall {
    /// Build every component. Channels close on sign-out and on identity loss.
    /// Must be called inside a tokio runtime; nothing else runs until
    /// `session.initialize()` is awaited.
    pub fn new(c: Collaborators, source: Arc<dyn ScanSource>, cfg: &RollcallConfig) -> Self {
        let reconciler = Arc::new(RoleReconciler::new(c.auth.clone(), c.profiles.clone()));
        let session = SessionStore::with_reconciler(c.auth.clone(), reconciler.clone(), cfg.init_timeout());
        let channels = ChannelManager::new(c.feed.clone(), cfg.subscribe_timeout());
        channels.close_on_identity_loss(&session);
        let auth = AuthService::new(c.auth.clone(), c.profiles.clone(), session.clone(), reconciler.clone())
            .with_channels(channels.clone());

        let roster = LiveRoster::new();
        let active = ActiveSession::new();
        let live = LiveViews::new(channels.clone(), roster.clone(), active.clone());
        let pipeline = Arc::new(ScanPipeline::new(
            Scanner::new(source),
            active,
            roster,
            c.attendance.clone(),
            c.directory.clone(),
            cfg.scan_cooldown(),
        ));
        Self { session, reconciler, auth, channels, live, pipeline }
    }
}
