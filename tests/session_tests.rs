mod support;

use std::sync::Arc;
use std::time::Duration;

use rollcall::identity::{AuthProvider, Identity, NormalizedRole, SessionStore};
use rollcall::storage::MemorySeed;

use support::{backend, campus_seed, eventually, PASSWORD};

fn signed_in_seed() -> MemorySeed {
    MemorySeed { signed_in: Some("stu@uni.ac".into()), ..campus_seed() }
}

#[tokio::test(start_paused = true)]
async fn concurrent_initialize_fetches_once() {
    let b = backend(signed_in_seed());
    b.set_identity_delay(Duration::from_millis(200));
    let store = SessionStore::new(b.clone(), Duration::from_secs(3));

    let calls = (0..8).map(|_| {
        let s = store.clone();
        async move { s.initialize().await }
    });
    let snaps = futures::future::join_all(calls).await;

    assert_eq!(b.calls().current_identity, 1);
    for snap in &snaps {
        assert!(snap.initialized);
        assert_eq!(snap.user_id(), Some("u-stu"));
        assert_eq!(snap.role, Some(NormalizedRole::Student));
    }
    // Later calls reuse the result.
    store.initialize().await;
    assert_eq!(b.calls().current_identity, 1);
}

#[tokio::test(start_paused = true)]
async fn initialize_times_out_to_guest() {
    let b = backend(signed_in_seed());
    b.set_identity_delay(Duration::from_secs(30));
    let store = SessionStore::new(b.clone(), Duration::from_millis(3_000));
    let started = tokio::time::Instant::now();
    let snap = store.initialize().await;
    assert!(snap.initialized);
    assert!(!snap.authenticated);
    assert!(snap.identity.is_none());
    assert!(started.elapsed() >= Duration::from_millis(3_000));
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test]
async fn backend_error_during_initialize_is_swallowed() {
    let b = backend(signed_in_seed());
    b.set_offline(true);
    let store = SessionStore::new(b.clone(), Duration::from_secs(3));
    let snap = store.initialize().await;
    assert!(snap.initialized);
    assert!(!snap.authenticated);
}

#[tokio::test]
async fn listener_tracks_sign_in_and_out() {
    let b = backend(campus_seed());
    let store = SessionStore::new(b.clone(), Duration::from_secs(3));
    assert!(!store.initialize().await.authenticated);

    b.sign_in_with_password("lect@uni.ac", PASSWORD).await.unwrap();
    eventually(|| store.is_authenticated()).await;
    assert_eq!(store.role(), Some(NormalizedRole::Lecturer));

    b.sign_out().await.unwrap();
    eventually(|| !store.is_authenticated()).await;
    assert_eq!(store.role(), None);
    assert!(store.identity().is_none());
}

#[tokio::test]
async fn set_user_flips_all_fields_together() {
    let b = backend(campus_seed());
    let store = SessionStore::new(b.clone(), Duration::from_secs(3));
    let mut rx = store.watch();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let watcher = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            sink.lock().push(rx.borrow_and_update().clone());
        }
    });

    store.set_user(Some(Identity::new("a", "a@uni.ac", Some("admin"))));
    tokio::task::yield_now().await;
    store.set_user(None);
    tokio::task::yield_now().await;
    store.set_user(Some(Identity::new("b", "b@uni.ac", None)));
    tokio::task::yield_now().await;

    drop(store);
    let _ = tokio::time::timeout(Duration::from_millis(200), watcher).await;
    for snap in seen.lock().iter() {
        assert_eq!(snap.authenticated, snap.identity.is_some());
        assert_eq!(snap.role, snap.identity.as_ref().map(|i| i.role()));
    }
}

#[tokio::test]
async fn resolved_role_for_departed_identity_is_dropped() {
    let b = backend(campus_seed());
    let store = SessionStore::new(b.clone(), Duration::from_secs(3));
    store.set_user(Some(Identity::new("a", "a@uni.ac", None)));
    assert_eq!(store.role(), Some(NormalizedRole::Student));
    assert!(store.apply_resolved_role("a", NormalizedRole::Lecturer));
    assert_eq!(store.role(), Some(NormalizedRole::Lecturer));

    store.set_user(None);
    assert!(!store.apply_resolved_role("a", NormalizedRole::Lecturer));
    assert_eq!(store.role(), None);
}
