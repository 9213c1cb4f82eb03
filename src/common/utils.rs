//! Utility functions for rfs

use std::future::Future;
use std::time::Duration;

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Run `fut` with a deadline, reporting expiry as `Error::Timeout`
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> crate::Result<T>
where
    F: Future<Output = crate::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(crate::Error::Timeout(format!("{} after {:?}", what, limit))),
    }
}
