//! Attendance domain: records, the live roster projection, and the
//! scan-to-attendance pipeline.

mod record;
mod roster;
mod cooldown;
mod scanner;
mod store;
mod pipeline;

pub use record::{ActiveSession, AttendanceRecord, AttendanceStatus, ClassSession, DeletedRecord};
pub use roster::{LiveRoster, RemoteChange, Roster, RosterChange, RosterEntry};
pub use cooldown::Cooldown;
pub use scanner::{Detection, NullSource, ScanSource, Scanner, ScannerState};
pub use store::{AttendanceStore, StudentDirectory};
pub use pipeline::{validate_code, ScanEvent, ScanOutcome, ScanPipeline};
