use super::*;
use crate::attendance::record::AttendanceStatus;
use chrono::TimeZone;

fn at(ms: i64) -> DateTime<Utc> { Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap() }

fn rec(id: &str, student: &str, status: AttendanceStatus, ms: i64) -> AttendanceRecord {
    AttendanceRecord { id: id.into(), student_id: student.into(), session_id: "T".into(), status, timestamp: at(ms) }
}

#[test]
fn later_timestamp_wins_and_older_is_stale() {
    let mut r = Roster::default();
    assert_eq!(r.upsert(rec("a", "S", AttendanceStatus::Present, 100)), RosterChange::Applied);
    assert_eq!(r.upsert(rec("b", "S", AttendanceStatus::Absent, 50)), RosterChange::Stale);
    assert_eq!(r.record("S", "T").unwrap().status, AttendanceStatus::Present);
    assert_eq!(r.upsert(rec("c", "S", AttendanceStatus::Late, 200)), RosterChange::Applied);
    assert_eq!(r.len(), 1);
    assert_eq!(r.record("S", "T").unwrap().status, AttendanceStatus::Late);
}

#[test]
fn echo_is_a_noop_that_adopts_backend_id() {
    let mut r = Roster::default();
    r.upsert(rec("local", "S", AttendanceStatus::Present, 100));
    assert_eq!(r.upsert(rec("remote", "S", AttendanceStatus::Present, 100)), RosterChange::Unchanged);
    assert_eq!(r.record("S", "T").unwrap().id, "remote");
    assert_eq!(r.len(), 1);
}

#[test]
fn tie_with_different_state_takes_later_arrival() {
    let mut r = Roster::default();
    r.upsert(rec("a", "S", AttendanceStatus::Present, 100));
    assert_eq!(r.upsert(rec("a", "S", AttendanceStatus::Excused, 100)), RosterChange::Applied);
    assert!(!r.entry("S", "T").present);
}

#[test]
fn delete_only_matches_current_row_id() {
    let mut r = Roster::default();
    r.upsert(rec("a", "S", AttendanceStatus::Present, 100));
    let old = DeletedRecord { id: "zzz".into(), student_id: Some("S".into()), session_id: Some("T".into()) };
    assert_eq!(r.remove(&old), RosterChange::Ignored);
    let by_id_only = DeletedRecord { id: "a".into(), student_id: None, session_id: None };
    assert_eq!(r.remove(&by_id_only), RosterChange::Applied);
    assert!(r.is_empty());
}

#[test]
fn entries_cover_enrolled_and_unknown_students() {
    let mut r = Roster::default();
    r.enroll("T", ["S1", "S2"]);
    r.upsert(rec("a", "S1", AttendanceStatus::Late, 10));
    r.upsert(rec("b", "S9", AttendanceStatus::Present, 20));
    let entries = r.entries("T");
    let ids: Vec<&str> = entries.iter().map(|e| e.student_id.as_str()).collect();
    assert_eq!(ids, vec!["S1", "S2", "S9"]);
    assert!(entries[0].present);
    assert!(!entries[1].present && entries[1].marked_at.is_none());
    assert_eq!(r.present_count("T"), 2);
    assert_eq!(r.present_count("other"), 0);
}

#[test]
fn revert_restores_previous_only_while_ours() {
    let live = LiveRoster::new();
    let mine = rec("mine", "S", AttendanceStatus::Present, 100);
    let (change, prev) = live.apply_local(mine.clone());
    assert_eq!(change, RosterChange::Applied);
    assert!(prev.is_none());
    assert!(live.revert_local(&mine, prev));
    assert!(live.is_empty());

    let (_, prev) = live.apply_local(mine.clone());
    live.apply_remote(RemoteChange::Upsert(rec("newer", "S", AttendanceStatus::Late, 300)));
    assert!(!live.revert_local(&mine, prev));
    assert_eq!(live.record("S", "T").unwrap().id, "newer");
    assert!(live.last_update().is_some());
}

#[test]
fn version_bumps_only_on_change() {
    let live = LiveRoster::new();
    let rx = live.watch();
    live.apply_remote(RemoteChange::Upsert(rec("a", "S", AttendanceStatus::Present, 1)));
    assert_eq!(*rx.borrow(), 1);
    live.apply_remote(RemoteChange::Upsert(rec("a", "S", AttendanceStatus::Present, 1)));
    live.apply_remote(RemoteChange::Upsert(rec("x", "S", AttendanceStatus::Absent, 0)));
    assert_eq!(*rx.borrow(), 1);
}
