//! Profile repair for freshly authenticated identities.
//! The auth service and the profile tables evolved independently, so a lecturer
//! can authenticate without a `teachers` row. This module heals that gap, at most
//! once at a time per identity, and never touches lecturer data for an account
//! that declares itself a student.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::principal::{Identity, Profile, ProfileTable};
use super::provider::{AuthProvider, ProfileStore};
use super::role::{is_lecturer_role, NormalizedRole};
use crate::flight::SingleFlight;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RepairKey {
    identity_id: String,
    lecturer_intent: bool,
}

pub struct RoleReconciler {
    auth: Arc<dyn AuthProvider>,
    profiles: Arc<dyn ProfileStore>,
    repairs: SingleFlight<RepairKey, Option<NormalizedRole>>,
}

impl RoleReconciler {
    pub fn new(auth: Arc<dyn AuthProvider>, profiles: Arc<dyn ProfileStore>) -> Self {
        Self { auth, profiles, repairs: SingleFlight::new() }
    }

    /// Make sure a profile backs `identity` and return the verified role.
    ///
    /// `None` means "could not verify": no identity, no profile and nothing to
    /// repair, or a backend failure (already logged). Callers then keep the
    /// identity's own normalized role.
    pub async fn ensure_profile(&self, identity: Option<&Identity>) -> Option<NormalizedRole> {
        let identity = identity?;
        if identity.is_declared_student() {
            return Some(NormalizedRole::Student);
        }
        let key = RepairKey {
            identity_id: identity.id.clone(),
            lecturer_intent: identity.raw_role.as_deref().map(is_lecturer_role).unwrap_or(false),
        };
        let auth = Arc::clone(&self.auth);
        let profiles = Arc::clone(&self.profiles);
        let identity = identity.clone();
        self.repairs.run(key, move || reconcile(auth, profiles, identity)).await
    }

    pub fn is_repairing(&self, identity_id: &str) -> bool {
        [false, true].iter().any(|&lecturer_intent| {
            self.repairs.is_in_flight(&RepairKey { identity_id: identity_id.to_string(), lecturer_intent })
        })
    }
}

async fn reconcile(auth: Arc<dyn AuthProvider>, profiles: Arc<dyn ProfileStore>, identity: Identity) -> Option<NormalizedRole> {
    let lecturer_intent = identity.raw_role.as_deref().map(is_lecturer_role).unwrap_or(false);
    if !lecturer_intent {
        return classify_existing(profiles.as_ref(), &identity).await;
    }

    match profiles.find_profile(ProfileTable::Teachers, &identity.id).await {
        Ok(Some(p)) => return Some(p.display_role()),
        Ok(None) => {}
        Err(e) => {
            warn!(target: "reconcile", user = %identity.id, "teacher profile lookup failed: {}", e);
            return None;
        }
    }

    let repaired = teacher_profile_for(&identity);
    info!(target: "reconcile", user = %identity.id, email = %identity.email, "teacher profile missing; repairing");
    let stored = match profiles.upsert_profile_on_email(ProfileTable::Teachers, &repaired).await {
        Ok(p) => p,
        Err(e) => {
            warn!(target: "reconcile", user = %identity.id, "profile repair failed: {}", e);
            return None;
        }
    };

    let role = stored.display_role();
    let already_recorded = identity.raw_role.as_deref().map(|r| r.eq_ignore_ascii_case(&stored.role)).unwrap_or(false);
    if !already_recorded {
        if let Err(e) = auth.update_role_metadata(&identity.id, &stored.role).await {
            // The profile exists now; the next reconcile will find it without metadata.
            warn!(target: "reconcile", user = %identity.id, "role metadata update failed: {}", e);
        }
    }
    Some(role)
}

/// Identity without a lecturer claim: report what the tables already say, never create.
async fn classify_existing(profiles: &dyn ProfileStore, identity: &Identity) -> Option<NormalizedRole> {
    match profiles.find_profile(ProfileTable::Students, &identity.id).await {
        Ok(Some(_)) => return Some(NormalizedRole::Student),
        Ok(None) => {}
        Err(e) => {
            warn!(target: "reconcile", user = %identity.id, "student profile lookup failed: {}", e);
            return None;
        }
    }
    match profiles.find_profile(ProfileTable::Teachers, &identity.id).await {
        Ok(Some(p)) => Some(p.display_role()),
        Ok(None) => {
            debug!(target: "reconcile", user = %identity.id, "no profile and no role claim; leaving unverified");
            None
        }
        Err(e) => {
            warn!(target: "reconcile", user = %identity.id, "teacher profile lookup failed: {}", e);
            None
        }
    }
}

fn teacher_profile_for(identity: &Identity) -> Profile {
    let first = identity.metadata_str("first_name").unwrap_or("").trim();
    let last = identity.metadata_str("last_name").unwrap_or("").trim();
    let full_name = format!("{} {}", first, last).trim().to_string();
    Profile {
        id: identity.id.clone(),
        email: identity.email.clone(),
        full_name: if full_name.is_empty() { None } else { Some(full_name) },
        role: identity.raw_role.as_deref().unwrap_or("lecturer").trim().to_ascii_lowercase(),
        external_id: identity.metadata_str("registration_id").map(str::to_string),
        department: identity.metadata_str("department").map(str::to_string),
        qr_code: None,
    }
}
