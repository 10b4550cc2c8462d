use chrono::{DateTime, SecondsFormat, Utc};

/// Source of wall-clock time for the lifecycle engine.
///
/// Abstracted behind a trait (rather than calling `Utc::now()` directly from
/// business logic) so tests can substitute a fixed or steppable clock
/// instead of sleeping real wall-clock seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// `now + base^attempts` seconds. `attempts` is the post-increment
    /// attempt count (the number of attempts already consumed).
    fn next_retry_at(&self, attempts: u32, base: f64) -> DateTime<Utc> {
        let delay_secs = base.powi(attempts as i32);
        self.now() + chrono::Duration::milliseconds((delay_secs * 1000.0).round() as i64)
    }
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Serialise a timestamp the way the rest of the system expects: ISO-8601
/// UTC with a trailing `Z`, never `+00:00`.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp liberally: accepts both a trailing `Z` and an explicit
/// `+00:00` offset.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// `serde(with = "...")` modules that serialise `DateTime<Utc>` fields with
/// the trailing-`Z` convention instead of chrono's default `+00:00` offset
/// suffix, so a job printed to JSON at the CLI boundary matches the same
/// wire format the store persists.
pub mod serde_ts {
    use super::{format_timestamp, parse_timestamp};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        format_timestamp(*dt).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }
}

/// As [`serde_ts`], for `Option<DateTime<Utc>>` fields.
pub mod serde_ts_opt {
    use super::{format_timestamp, parse_timestamp};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(dt: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        dt.map(format_timestamp).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(raw) => parse_timestamp(&raw)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_exact_exponential() {
        let clock = SystemClock;
        let before = clock.now();
        let at1 = clock.next_retry_at(1, 2.0);
        let at2 = clock.next_retry_at(2, 2.0);
        assert!((at1 - before).num_seconds() >= 1);
        assert!((at2 - before).num_seconds() >= 3);
    }

    #[test]
    fn format_round_trips_through_parse() {
        let now = Utc::now();
        let formatted = format_timestamp(now);
        assert!(formatted.ends_with('Z'));
        let parsed = parse_timestamp(&formatted).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn parse_accepts_explicit_offset() {
        let parsed = parse_timestamp("2025-01-01T00:00:00+00:00");
        assert!(parsed.is_some());
    }
}
