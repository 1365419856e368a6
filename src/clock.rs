use chrono::Utc;

/// Wall-clock milliseconds since the Unix epoch. Browser console markers
/// carry `Date.now()` values, so every instant we compare against them is kept
/// in the same unit and origin.
pub type Millis = i64;

pub fn now_ms() -> Millis {
  Utc::now().timestamp_millis()
}
