//! Default values for configuration tunables.

use rust_decimal::Decimal;

pub(super) fn price_cap() -> Decimal {
    Decimal::from(10_000)
}

pub(super) fn min_text_len() -> usize {
    10
}

pub(super) fn max_text_len() -> usize {
    1000
}

pub(super) fn max_links() -> usize {
    2
}

pub(super) fn denylist() -> Vec<String> {
    [
        "scam",
        "fraud",
        "hack",
        "illegal",
        "drugs",
        "weapons",
        "violence",
        "hate",
        "discrimination",
        "adult",
        "porn",
        "gambling",
        "casino",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub(super) fn default_duration_hours() -> i64 {
    1
}

pub(super) fn expiry_days() -> i64 {
    7
}

pub(super) fn max_retries() -> u32 {
    3
}

pub(super) fn retry_backoff_secs() -> u64 {
    600
}

pub(super) fn sweep_interval_secs() -> u64 {
    300
}

pub(super) fn cleanup_interval_secs() -> u64 {
    3600
}

pub(super) fn misfire_grace_secs() -> u64 {
    30
}

pub(super) fn max_concurrent_jobs() -> usize {
    8
}

pub(super) fn gateway_backend() -> String {
    "noop".to_string()
}
