use super::*;
use crate::attendance::AttendanceStatus;
use crate::identity::NormalizedRole;
use chrono::Utc;

fn backend_with_lecturer() -> MemoryBackend {
    let b = MemoryBackend::new();
    b.add_user(Some("u-lect"), "lect@uni.ac", "secret1", Some("teacher"), Default::default()).unwrap();
    b
}

#[tokio::test]
async fn sign_in_checks_password_and_emits_event() {
    let b = backend_with_lecturer();
    let mut rx = b.on_identity_change();
    let err = b.sign_in_with_password("lect@uni.ac", "wrong").await.unwrap_err();
    assert_eq!(err.code_str(), "invalid_credentials");

    let id = b.sign_in_with_password("LECT@uni.ac", "secret1").await.unwrap();
    assert_eq!(id.id, "u-lect");
    let ev = rx.recv().await.unwrap();
    assert_eq!(ev.kind, IdentityEventKind::SignedIn);
    assert_eq!(b.current_identity().await.unwrap().unwrap().id, "u-lect");

    b.sign_out().await.unwrap();
    assert_eq!(rx.recv().await.unwrap().kind, IdentityEventKind::SignedOut);
    assert!(b.current_identity().await.unwrap().is_none());
}

#[tokio::test]
async fn offline_fails_every_call_as_network() {
    let b = backend_with_lecturer();
    b.set_offline(true);
    let err = b.current_identity().await.unwrap_err();
    assert!(err.is_network());
    assert!(b.find_profile(ProfileTable::Teachers, "u-lect").await.unwrap_err().is_network());
    assert_eq!(b.calls().current_identity, 1);
}

#[tokio::test]
async fn upsert_on_email_heals_orphaned_row() {
    let b = MemoryBackend::new();
    let orphan = Profile { id: "old".into(), email: "x@uni.ac".into(), role: "teacher".into(), ..Default::default() };
    b.insert_profile(ProfileTable::Teachers, &orphan).await.unwrap();
    let dup = b.insert_profile(ProfileTable::Teachers, &Profile { id: "new".into(), ..orphan.clone() }).await.unwrap_err();
    assert_eq!(dup.code_str(), "duplicate_profile");

    let healed = Profile { id: "new".into(), ..orphan };
    b.upsert_profile_on_email(ProfileTable::Teachers, &healed).await.unwrap();
    assert_eq!(b.profile_count(ProfileTable::Teachers), 1);
    assert!(b.profile(ProfileTable::Teachers, "new").is_some());
    assert_eq!(b.calls().upsert_teachers, 1);
    assert_eq!(b.calls().upsert_students, 0);
}

#[tokio::test]
async fn attendance_upsert_keeps_row_id_and_echoes() {
    let b = MemoryBackend::new();
    let filter = ChangeFilter::eq(ATTENDANCE_TABLE, "session_id", "T");
    let (_h, mut rx) = b.open_channel(&ResourceKey::attendance("T"), &filter).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), FeedMessage::Status(ChannelStatus::Subscribed));

    let first = AttendanceRecord::present("S", "T", Utc::now());
    let stored = b.record_attendance(&first).await.unwrap();
    assert_eq!(stored.id, first.id);
    let FeedMessage::Change(ev) = rx.recv().await.unwrap() else { panic!("expected change") };
    assert_eq!(ev.kind, crate::realtime::ChangeKind::Insert);

    let mut second = AttendanceRecord::present("S", "T", Utc::now());
    second.status = AttendanceStatus::Late;
    let stored = b.record_attendance(&second).await.unwrap();
    assert_eq!(stored.id, first.id);
    assert_eq!(stored.status, AttendanceStatus::Late);
    let FeedMessage::Change(ev) = rx.recv().await.unwrap() else { panic!("expected change") };
    assert_eq!(ev.kind, crate::realtime::ChangeKind::Update);

    // Other sessions do not leak into this channel.
    b.record_attendance(&AttendanceRecord::present("S", "U", Utc::now())).await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn older_attendance_write_keeps_newer_row() {
    let b = MemoryBackend::new();
    let filter = ChangeFilter::eq(ATTENDANCE_TABLE, "session_id", "T");
    let (_h, mut rx) = b.open_channel(&ResourceKey::attendance("T"), &filter).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), FeedMessage::Status(ChannelStatus::Subscribed));

    let now = Utc::now();
    let mut newer = AttendanceRecord::present("S", "T", now);
    newer.status = AttendanceStatus::Absent;
    b.record_attendance(&newer).await.unwrap();
    assert!(matches!(rx.recv().await, Some(FeedMessage::Change(_))));

    let older = AttendanceRecord::present("S", "T", now - chrono::Duration::seconds(5));
    let kept = b.record_attendance(&older).await.unwrap();
    assert_eq!(kept, newer);
    assert_eq!(b.attendance_row("S", "T").unwrap(), newer);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn failing_and_silent_channels() {
    let b = MemoryBackend::new();
    let filter = ChangeFilter::table(SESSIONS_TABLE);
    b.set_fail_channels(true);
    let (_h, mut rx) = b.open_channel(&ResourceKey::new("x"), &filter).await.unwrap();
    assert!(matches!(rx.recv().await, Some(FeedMessage::Status(ChannelStatus::Errored(_)))));

    b.set_fail_channels(false);
    b.set_silent_channels(true);
    let (h, mut rx) = b.open_channel(&ResourceKey::new("y"), &filter).await.unwrap();
    assert!(rx.try_recv().is_err());
    b.close_channel(h).await.unwrap();
    assert_eq!(rx.recv().await, Some(FeedMessage::Status(ChannelStatus::Closed)));
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn sign_up_stores_role_metadata() {
    let b = MemoryBackend::new();
    let req = SignUpRequest {
        email: "s@uni.ac".into(),
        password: "secret1".into(),
        role: NormalizedRole::Student,
        first_name: "Ada".into(),
        last_name: "L".into(),
        external_id: "STU1".into(),
        department: None,
    };
    let id = b.sign_up(&req).await.unwrap();
    assert_eq!(id.raw_role.as_deref(), Some("student"));
    assert_eq!(id.metadata_str("student_id"), Some("STU1"));
    assert_eq!(b.sign_up(&req).await.unwrap_err().code_str(), "email_taken");
}

#[test]
fn seed_signed_in_must_exist() {
    let seed = MemorySeed { signed_in: Some("ghost@uni.ac".into()), ..Default::default() };
    assert!(MemoryBackend::from_seed(seed).is_err());
}
