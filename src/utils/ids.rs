//! Entry and session identifiers.
//!
//! Ids are a millisecond timestamp plus a short random hex suffix, so they
//! sort by insertion time while staying unique under concurrent inserts.

use uuid::Uuid;

/// Current instant as integer milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fresh row id: `<ms>-<4 hex chars>`.
pub fn new_entry_id(timestamp_ms: i64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", timestamp_ms, &suffix[..4])
}

/// Session id for a process started at `start_ms`: `session_<ms>`.
pub fn session_id_for(start_ms: i64) -> String {
    format!("session_{}", start_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_shape() {
        let id = new_entry_id(1700000000000);
        let (ts, suffix) = id.split_once('-').unwrap();
        assert_eq!(ts, "1700000000000");
        assert_eq!(suffix.len(), 4);
    }

    #[test]
    fn test_entry_ids_unique() {
        let a = new_entry_id(1700000000000);
        let b = new_entry_id(1700000000000);
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_id_shape() {
        assert_eq!(session_id_for(1700000000000), "session_1700000000000");
    }
}
