//! Small helpers shared by the ingestion service

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use sha2::{Digest, Sha256};

/// Number of characters in a generated report id
pub const REPORT_ID_LEN: usize = 12;

/// Current time in epoch seconds
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Derive a short report id from a salt, the submission time and the agent id.
///
/// Not guaranteed unique, callers check for an existing report with the same id.
pub fn short_report_id(salt: u64, time: i64, agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}{}{}", salt, time, agent));
    let digest = format!("{:x}", hasher.finalize());
    digest[..REPORT_ID_LEN].to_lowercase()
}

/// Generate a report id with a fresh random salt
pub fn generate_report_id(time: i64, agent: &str) -> String {
    short_report_id(rand::thread_rng().gen(), time, agent)
}
