use chrono::{DateTime, DurationRound, Utc};

/// Current UTC time at the precision the jobs table stores.
///
/// Every timestamp that reaches the database goes through microsecond
/// truncation so that values written by Rust and values compared in SQL
/// agree across engines.
pub(crate) fn utc_now() -> DateTime<Utc> {
    truncate_micros(Utc::now())
}

pub(crate) fn truncate_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(chrono::Duration::microseconds(1)).unwrap_or(t)
}

/// Checked `t + d`, saturating at the far end of the chrono range.
pub(crate) fn add_duration(t: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|delta| t.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn truncates_to_microseconds() {
        let t = truncate_micros(Utc::now());
        assert_eq!(t.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn add_duration_saturates() {
        let t = utc_now();
        let far = add_duration(t, std::time::Duration::from_secs(u64::MAX));
        assert_eq!(far, DateTime::<Utc>::MAX_UTC);
    }
}
