use serde::{Deserialize, Serialize};

/// Role as the clients see it. The backend keeps finer values (`teacher`, `admin`)
/// on the identity metadata and profile rows; everything that reads a role goes
/// through `normalize_role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizedRole {
    Student,
    Lecturer,
}

impl NormalizedRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizedRole::Student => "student",
            NormalizedRole::Lecturer => "lecturer",
        }
    }
}

impl std::fmt::Display for NormalizedRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Fold a raw backend role into the client role. Unknown or missing values are
/// treated as student (least privilege).
pub fn normalize_role(raw: Option<&str>) -> NormalizedRole {
    match raw.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
        Some("lecturer") | Some("teacher") | Some("admin") => NormalizedRole::Lecturer,
        _ => NormalizedRole::Student,
    }
}

/// True if the raw value names one of the lecturer-side roles.
pub fn is_lecturer_role(raw: &str) -> bool {
    normalize_role(Some(raw)) == NormalizedRole::Lecturer
}

/// Which login surface a sign-in came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Portal {
    Student,
    Lecturer,
}

impl Portal {
    pub fn expected_role(&self) -> NormalizedRole {
        match self {
            Portal::Student => NormalizedRole::Student,
            Portal::Lecturer => NormalizedRole::Lecturer,
        }
    }
}
