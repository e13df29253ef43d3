// Collaborator seams toward the backend-as-a-service. Keep these narrow: the core
// only relies on what is declared here.
use async_trait::async_trait;
use tokio::sync::broadcast;

use super::principal::{Identity, IdentityEvent, Profile, ProfileTable};
use super::role::NormalizedRole;
use crate::error::AppResult;

#[derive(Debug, Clone)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub role: NormalizedRole,
    pub first_name: String,
    pub last_name: String,
    /// Student number or lecturer registration id.
    pub external_id: String,
    /// Class section (students) or department (lecturers).
    pub department: Option<String>,
}

impl SignUpRequest {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim()).trim().to_string()
    }

    /// User metadata stored with the identity.
    pub fn metadata(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut m = serde_json::Map::new();
        m.insert("role".into(), self.role.as_str().into());
        m.insert("first_name".into(), self.first_name.clone().into());
        m.insert("last_name".into(), self.last_name.clone().into());
        let id_key = match self.role {
            NormalizedRole::Student => "student_id",
            NormalizedRole::Lecturer => "registration_id",
        };
        m.insert(id_key.into(), self.external_id.clone().into());
        if let Some(dept) = self.department.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            m.insert("department".into(), dept.into());
        }
        m
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> AppResult<Identity>;
    async fn sign_up(&self, req: &SignUpRequest) -> AppResult<Identity>;
    async fn sign_out(&self) -> AppResult<()>;
    /// Identity of the persisted session, if any. May be slow; callers bound it with a timeout.
    async fn current_identity(&self) -> AppResult<Option<Identity>>;
    /// Write the resolved role back into the identity's metadata.
    async fn update_role_metadata(&self, user_id: &str, role: &str) -> AppResult<Identity>;
    async fn reset_password(&self, email: &str) -> AppResult<()>;
    /// Standing listener; every sign-in, sign-out and metadata change is delivered.
    fn on_identity_change(&self) -> broadcast::Receiver<IdentityEvent>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_profile(&self, table: ProfileTable, id: &str) -> AppResult<Option<Profile>>;
    async fn insert_profile(&self, table: ProfileTable, profile: &Profile) -> AppResult<Profile>;
    /// Insert, or on an existing row with the same email, overwrite it (heals orphaned rows).
    async fn upsert_profile_on_email(&self, table: ProfileTable, profile: &Profile) -> AppResult<Profile>;
}
