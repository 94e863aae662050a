use std::time::Duration;

use chrono::{DateTime, Utc};

pub fn time_millis() -> i64 {
    let time: DateTime<chrono::Utc> = Utc::now();
    time.timestamp_millis()
}

/// Returns `now + delay` as a UTC date.
pub fn after(delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    Utc::now().checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Converts the distance between two dates into a std duration, saturating at zero.
pub fn until(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}
