use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use super::principal::{Identity, Profile, ProfileTable};
use super::provider::{AuthProvider, ProfileStore, SignUpRequest};
use super::reconciler::RoleReconciler;
use super::role::{NormalizedRole, Portal};
use super::session::SessionStore;
use crate::error::{AppError, AppResult};
use crate::realtime::ChannelManager;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

const MIN_PASSWORD_LEN: usize = 6;

pub fn validate_email(email: &str) -> AppResult<&str> {
    let email = email.trim();
    if EMAIL_RE.is_match(email) { Ok(email) } else { Err(AppError::user("invalid_email", "Please enter a valid email address.")) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignedIn {
    pub identity: Identity,
    pub role: NormalizedRole,
    /// True when a profile row backs the role (found or repaired).
    pub verified: bool,
}

/// Sign-in/sign-up/sign-out flows. Drives the session store and the reconciler;
/// never writes session state except through `SessionStore`.
pub struct AuthService {
    auth: Arc<dyn AuthProvider>,
    profiles: Arc<dyn ProfileStore>,
    session: SessionStore,
    reconciler: Arc<RoleReconciler>,
    channels: Option<ChannelManager>,
}

impl AuthService {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        profiles: Arc<dyn ProfileStore>,
        session: SessionStore,
        reconciler: Arc<RoleReconciler>,
    ) -> Self {
        Self { auth, profiles, session, reconciler, channels: None }
    }

    /// Channels to tear down on sign-out.
    pub fn with_channels(mut self, channels: ChannelManager) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn session(&self) -> &SessionStore { &self.session }

    pub async fn sign_in(&self, email: &str, password: &str, portal: Portal) -> AppResult<SignedIn> {
        let email = validate_email(email)?;
        if password.is_empty() {
            return Err(AppError::user("missing_password", "Please enter your password."));
        }
        let identity = self.auth.sign_in_with_password(email, password).await?;
        self.session.set_user(Some(identity.clone()));

        let verified = self.verify_role(&identity, portal).await;
        let role = verified.unwrap_or_else(|| identity.role());
        if role != portal.expected_role() {
            warn!(target: "session", user = %identity.id, %role, ?portal, "role does not match login portal; signing out");
            if let Err(e) = self.sign_out().await {
                warn!(target: "session", "sign-out after portal mismatch failed: {}", e);
            }
            return Err(AppError::auth(
                "portal_mismatch".to_string(),
                format!("{} account cannot use the {:?} login", role, portal),
            ));
        }
        if let Some(r) = verified {
            self.session.apply_resolved_role(&identity.id, r);
        }
        info!(target: "session", user = %identity.id, %role, verified = verified.is_some(), "signed in");
        Ok(SignedIn { identity, role, verified: verified.is_some() })
    }

    async fn verify_role(&self, identity: &Identity, portal: Portal) -> Option<NormalizedRole> {
        let found = self.reconciler.ensure_profile(Some(identity)).await;
        if found.is_some() || identity.raw_role.is_some() || portal != Portal::Lecturer {
            return found;
        }
        // No role claim and no profile anywhere: the lecturer login itself is the claim.
        let role = NormalizedRole::Lecturer.as_str();
        let mut claim = identity.clone();
        claim.raw_role = Some(role.to_string());
        let resolved = self.reconciler.ensure_profile(Some(&claim)).await;
        if resolved.is_some() {
            if let Err(e) = self.auth.update_role_metadata(&identity.id, role).await {
                warn!(target: "session", user = %identity.id, "role metadata update failed: {}", e);
            }
        }
        resolved
    }

    pub async fn sign_up(&self, req: &SignUpRequest) -> AppResult<Identity> {
        validate_email(&req.email)?;
        if req.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::user("weak_password".to_string(), format!("Password must be at least {} characters.", MIN_PASSWORD_LEN)));
        }
        if req.full_name().is_empty() {
            return Err(AppError::user("missing_name", "Please enter your first and last name."));
        }
        if req.external_id.trim().is_empty() {
            return Err(AppError::user("missing_id", "Please enter your ID."));
        }

        let identity = self.auth.sign_up(req).await?;
        let external_id = req.external_id.trim().to_string();
        let profile = Profile {
            id: identity.id.clone(),
            email: identity.email.clone(),
            full_name: Some(req.full_name()),
            role: req.role.as_str().to_string(),
            qr_code: (req.role == NormalizedRole::Student).then(|| external_id.clone()),
            external_id: Some(external_id),
            department: req.department.clone(),
        };
        let table = ProfileTable::for_role(req.role);
        match self.profiles.insert_profile(table, &profile).await {
            Ok(_) => {}
            Err(e) if req.role == NormalizedRole::Lecturer => {
                // Repaired on first sign-in.
                warn!(target: "session", user = %identity.id, "teacher profile insert failed at sign-up: {}", e);
            }
            Err(e) => return Err(e),
        }
        info!(target: "session", user = %identity.id, role = %req.role, "signed up");
        Ok(identity)
    }

    /// Local state is cleared even when the backend call fails.
    pub async fn sign_out(&self) -> AppResult<()> {
        let res = self.auth.sign_out().await;
        self.session.set_user(None);
        if let Some(channels) = &self.channels {
            channels.unsubscribe_all().await;
        }
        if let Err(e) = &res {
            warn!(target: "session", "backend sign-out failed: {}", e);
        }
        res
    }

    pub async fn reset_password(&self, email: &str) -> AppResult<()> {
        let email = validate_email(email)?;
        self.auth.reset_password(email).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        assert_eq!(validate_email("  a@b.io ").unwrap(), "a@b.io");
        assert!(validate_email("nope").is_err());
        assert!(validate_email("a@b").is_err());
        assert!(validate_email("a b@c.de").is_err());
        assert_eq!(validate_email("").unwrap_err().code_str(), "invalid_email");
    }
}
