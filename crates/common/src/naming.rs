//! Collision-free resource naming
//!
//! Names combine the wall-clock epoch (for readability when browsing a
//! shared backend), a tag drawn once per process from a v4 UUID, and a
//! monotonic per-process sequence number. Two workers never share the
//! tag, and one worker never repeats a sequence number, so names stay
//! unique even when several scenarios start within the same millisecond.

use once_cell::sync::Lazy;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static PROCESS_TAG: Lazy<String> = Lazy::new(|| uuid::Uuid::new_v4().simple().to_string()[..6].to_string());

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the Unix epoch
pub fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// The per-process tag embedded in every generated name
pub fn process_tag() -> &'static str {
    &PROCESS_TAG
}

/// Generate a unique, DNS-label-safe name with the given prefix.
///
/// Format: `<prefix>-<epoch_ms>-<tag><seq>`
pub fn unique_name(prefix: &str) -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}{}", prefix, epoch_millis(), process_tag(), seq)
}

/// Random lowercase hex string of `bytes * 2` characters
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
