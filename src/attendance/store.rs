use async_trait::async_trait;

use super::record::AttendanceRecord;
use crate::error::AppResult;

/// Backend `attendance` table.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    /// Upsert on `(student_id, session_id)`. Returns the stored row.
    async fn record_attendance(&self, record: &AttendanceRecord) -> AppResult<AttendanceRecord>;
    async fn attendance_for_session(&self, session_id: &str) -> AppResult<Vec<AttendanceRecord>>;
}

/// Maps scanned codes to students and lists who is expected in a session.
#[async_trait]
pub trait StudentDirectory: Send + Sync {
    async fn resolve_code(&self, code: &str) -> AppResult<Option<String>>;
    async fn roster_for_session(&self, session_id: &str) -> AppResult<Vec<String>>;
}
