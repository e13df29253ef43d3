use serde::{Deserialize, Serialize};

use super::role::{normalize_role, NormalizedRole};

/// Authenticated principal as issued by the auth collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    pub id: String,
    pub email: String,
    /// Fine-grained role from user metadata (`student`, `teacher`, `lecturer`, `admin`), if any.
    #[serde(default)]
    pub raw_role: Option<String>,
    /// Remaining user metadata (names, student number, ...).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Identity {
    pub fn new(id: impl Into<String>, email: impl Into<String>, raw_role: Option<&str>) -> Self {
        Self { id: id.into(), email: email.into(), raw_role: raw_role.map(str::to_string), metadata: Default::default() }
    }

    pub fn role(&self) -> NormalizedRole { normalize_role(self.raw_role.as_deref()) }

    /// Explicitly marked student (not merely defaulted to student).
    pub fn is_declared_student(&self) -> bool {
        self.raw_role.as_deref().map(|r| r.trim().eq_ignore_ascii_case("student")).unwrap_or(false)
    }

    pub fn is_admin(&self) -> bool {
        self.raw_role.as_deref().map(|r| r.trim().eq_ignore_ascii_case("admin")).unwrap_or(false)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// The two independently evolved profile tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileTable {
    Students,
    Teachers,
}

impl ProfileTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            ProfileTable::Students => "students",
            ProfileTable::Teachers => "teachers",
        }
    }

    pub fn for_role(role: NormalizedRole) -> Self {
        match role {
            NormalizedRole::Student => ProfileTable::Students,
            NormalizedRole::Lecturer => ProfileTable::Teachers,
        }
    }
}

/// Role-specific persisted record keyed by the identity id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    /// Backend role value kept at full granularity (`student`, `teacher`, `admin`, ...).
    pub role: String,
    /// Student number or lecturer registration id.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Class section for students, department for lecturers.
    #[serde(default)]
    pub department: Option<String>,
    /// Value encoded on the student's card; students only.
    #[serde(default)]
    pub qr_code: Option<String>,
}

impl Profile {
    pub fn display_role(&self) -> NormalizedRole { normalize_role(Some(&self.role)) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityEventKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// Notification delivered to standing identity-change listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityEvent {
    pub kind: IdentityEventKind,
    pub identity: Option<Identity>,
}
