use chrono::Utc;

/// Millisecond wall-clock timestamp used for created_at / updated_at columns.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
