/// Milliseconds since the Unix epoch.
///
/// Clamps to zero if the system clock reports a pre-epoch time.
pub fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
