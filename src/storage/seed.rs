use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::attendance::{AttendanceRecord, ClassSession};
use crate::identity::Profile;

/// Account to create at startup. Passwords are hashed when the seed is loaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedUser {
    #[serde(default)]
    pub id: Option<String>,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Initial contents of an in-process backend, usually read from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySeed {
    pub users: Vec<SeedUser>,
    pub students: Vec<Profile>,
    pub teachers: Vec<Profile>,
    pub sessions: Vec<ClassSession>,
    /// session id -> enrolled student ids
    pub enrolments: BTreeMap<String, Vec<String>>,
    pub attendance: Vec<AttendanceRecord>,
    /// Email of the account with a persisted session, as if the app was reopened.
    pub signed_in: Option<String>,
}

impl MemorySeed {
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("parsing seed json")
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading seed {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("seed {}", path.display()))
    }
}
