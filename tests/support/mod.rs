#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rollcall::app::{Collaborators, Rollcall};
use rollcall::attendance::{ClassSession, NullSource};
use rollcall::config::RollcallConfig;
use rollcall::identity::Profile;
use rollcall::storage::{MemoryBackend, MemorySeed, SeedUser};

pub const PASSWORD: &str = "secret1";

pub fn user(id: &str, email: &str, role: Option<&str>) -> SeedUser {
    SeedUser { id: Some(id.into()), email: email.into(), password: PASSWORD.into(), role: role.map(str::to_string), metadata: Default::default() }
}

pub fn student_profile(id: &str, email: &str, number: &str) -> Profile {
    Profile {
        id: id.into(),
        email: email.into(),
        full_name: Some(format!("Student {}", number)),
        role: "student".into(),
        external_id: Some(number.into()),
        department: None,
        qr_code: Some(number.into()),
    }
}

pub fn class(session_id: &str, active: bool) -> ClassSession {
    ClassSession { session_id: session_id.into(), course_id: "C1".into(), session_name: Some("Lecture".into()), is_active: active }
}

/// A lecturer without a teachers row, a student with a profile, and session T.
pub fn campus_seed() -> MemorySeed {
    MemorySeed {
        users: vec![
            user("u-lect", "lect@uni.ac", Some("teacher")),
            user("u-stu", "stu@uni.ac", Some("student")),
            user("u-bare", "bare@uni.ac", None),
        ],
        students: vec![student_profile("u-stu", "stu@uni.ac", "STU1"), student_profile("u-stu2", "stu2@uni.ac", "STU2")],
        sessions: vec![class("T", true)],
        enrolments: [("T".to_string(), vec!["u-stu".to_string(), "u-stu2".to_string()])].into_iter().collect(),
        ..Default::default()
    }
}

pub fn backend(seed: MemorySeed) -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::from_seed(seed).unwrap())
}

pub fn config() -> RollcallConfig {
    RollcallConfig { subscribe_timeout_ms: 1_000, ..Default::default() }
}

pub fn app(backend: &Arc<MemoryBackend>) -> Rollcall {
    Rollcall::new(Collaborators::memory(backend.clone()), Arc::new(NullSource), &config())
}

/// Poll `cond` until it holds, yielding to spawned tasks in between.
pub async fn eventually<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() { return; }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
