use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::principal::{Identity, IdentityEvent, IdentityEventKind};
use super::provider::AuthProvider;
use super::reconciler::RoleReconciler;
use super::role::{normalize_role, NormalizedRole};
use crate::tprintln;

/// Read-only view of "who is the current user and is that answer ready yet".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub identity: Option<Identity>,
    pub role: Option<NormalizedRole>,
    pub authenticated: bool,
    pub initialized: bool,
}

impl SessionSnapshot {
    pub fn user_id(&self) -> Option<&str> { self.identity.as_ref().map(|i| i.id.as_str()) }
}

enum InitOutcome {
    Fetched(Option<Identity>),
    FetchFailed(String),
    TimedOut,
    ListenerFirst,
}

struct SessionInner {
    auth: Arc<dyn AuthProvider>,
    reconciler: Option<Arc<RoleReconciler>>,
    state: watch::Sender<SessionSnapshot>,
    init: OnceCell<SessionSnapshot>,
    init_timeout: Duration,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(h) = self.listener.get_mut().take() { h.abort(); }
    }
}

/// Single-writer container for the current identity. Clones share state; only
/// `set_user` and `apply_resolved_role` write it.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionInner>,
}

impl SessionStore {
    pub fn new(auth: Arc<dyn AuthProvider>, init_timeout: Duration) -> Self {
        Self::build(auth, None, init_timeout)
    }

    /// Store whose identity listener also repairs profiles as identities arrive.
    pub fn with_reconciler(auth: Arc<dyn AuthProvider>, reconciler: Arc<RoleReconciler>, init_timeout: Duration) -> Self {
        Self::build(auth, Some(reconciler), init_timeout)
    }

    fn build(auth: Arc<dyn AuthProvider>, reconciler: Option<Arc<RoleReconciler>>, init_timeout: Duration) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            inner: Arc::new(SessionInner {
                auth,
                reconciler,
                state,
                init: OnceCell::new(),
                init_timeout,
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot { self.inner.state.borrow().clone() }
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> { self.inner.state.subscribe() }
    pub fn is_initialized(&self) -> bool { self.inner.state.borrow().initialized }
    pub fn is_authenticated(&self) -> bool { self.inner.state.borrow().authenticated }
    pub fn role(&self) -> Option<NormalizedRole> { self.inner.state.borrow().role }
    pub fn identity(&self) -> Option<Identity> { self.inner.state.borrow().identity.clone() }

    /// Idempotent: the first caller does the work, everyone else (concurrent or
    /// later) receives the same resolved snapshot.
    pub async fn initialize(&self) -> SessionSnapshot {
        self.inner.init.get_or_init(|| self.run_initialize()).await.clone()
    }

    async fn run_initialize(&self) -> SessionSnapshot {
        self.start_listener();

        let auth = Arc::clone(&self.inner.auth);
        let outcome = tokio::select! {
            res = auth.current_identity() => match res {
                Ok(identity) => InitOutcome::Fetched(identity),
                Err(e) => InitOutcome::FetchFailed(e.to_string()),
            },
            _ = tokio::time::sleep(self.inner.init_timeout) => InitOutcome::TimedOut,
            _ = wait_initialized(self.watch()) => InitOutcome::ListenerFirst,
        };

        match outcome {
            InitOutcome::Fetched(identity) => {
                debug!(target: "session", user = ?identity.as_ref().map(|i| i.id.as_str()), "initial identity fetched");
                self.write_user(identity.clone(), true);
                if let Some(identity) = identity { self.spawn_reconcile(identity); }
            }
            InitOutcome::FetchFailed(msg) => {
                warn!(target: "session", "Failed to initialize session: {}; continuing unauthenticated", msg);
                self.write_user(None, true);
            }
            InitOutcome::TimedOut => {
                warn!(target: "session", timeout_ms = self.inner.init_timeout.as_millis() as u64, "identity fetch timed out; continuing unauthenticated");
                self.write_user(None, true);
            }
            InitOutcome::ListenerFirst => {
                debug!(target: "session", "identity listener resolved before the initial fetch");
            }
        }
        let snap = self.snapshot();
        info!(target: "session", authenticated = snap.authenticated, role = ?snap.role, "session initialized");
        snap
    }

    /// Replace the current identity. Identity, role and authenticated flip together.
    pub fn set_user(&self, identity: Option<Identity>) {
        self.write_user(identity, false);
    }

    fn write_user(&self, identity: Option<Identity>, mark_initialized: bool) {
        tprintln!("session.set_user user={:?}", identity.as_ref().map(|i| i.id.as_str()));
        self.inner.state.send_if_modified(|s| {
            let role = identity.as_ref().map(|i| i.role());
            let next = SessionSnapshot {
                authenticated: identity.is_some(),
                identity,
                role,
                initialized: s.initialized || mark_initialized,
            };
            if *s == next { return false; }
            *s = next;
            true
        });
    }

    /// Apply a role resolved by profile repair, but only while `identity_id` is
    /// still the signed-in identity. Returns false when the identity moved on.
    pub fn apply_resolved_role(&self, identity_id: &str, role: NormalizedRole) -> bool {
        let mut applied = false;
        self.inner.state.send_if_modified(|s| {
            let current = s.identity.as_ref().map(|i| i.id == identity_id).unwrap_or(false);
            if !current { return false; }
            applied = true;
            if s.role == Some(role) { return false; }
            s.role = Some(role);
            if let Some(identity) = s.identity.as_mut() {
                if normalize_role(identity.raw_role.as_deref()) != role {
                    identity.raw_role = Some(role.as_str().to_string());
                }
            }
            true
        });
        if !applied {
            debug!(target: "session", identity_id, "dropping resolved role for stale identity");
        }
        applied
    }

    fn start_listener(&self) {
        let mut slot = self.inner.listener.lock();
        if slot.is_some() { return; }
        let rx = self.inner.auth.on_identity_change();
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(listen(weak, rx)));
    }

    fn spawn_reconcile(&self, identity: Identity) {
        if self.inner.reconciler.is_none() { return; }
        let store = self.clone();
        tokio::spawn(async move { store.reconcile(identity).await; });
    }

    async fn reconcile(&self, identity: Identity) {
        let Some(reconciler) = self.inner.reconciler.clone() else { return; };
        if let Some(role) = reconciler.ensure_profile(Some(&identity)).await {
            self.apply_resolved_role(&identity.id, role);
        }
    }

    async fn on_identity_event(&self, ev: IdentityEvent) {
        debug!(target: "session", kind = ?ev.kind, "identity change");
        self.write_user(ev.identity.clone(), true);
        let wants_reconcile = !matches!(ev.kind, IdentityEventKind::SignedOut | IdentityEventKind::TokenRefreshed);
        if let (true, Some(identity)) = (wants_reconcile, ev.identity) {
            self.reconcile(identity).await;
        }
    }
}

async fn listen(weak: Weak<SessionInner>, mut rx: broadcast::Receiver<IdentityEvent>) {
    loop {
        match rx.recv().await {
            Ok(ev) => {
                let Some(inner) = weak.upgrade() else { break; };
                SessionStore { inner }.on_identity_event(ev).await;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(target: "session", skipped = n, "identity listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn wait_initialized(mut rx: watch::Receiver<SessionSnapshot>) {
    loop {
        if rx.borrow_and_update().initialized { return; }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
