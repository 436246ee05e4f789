//! Timestamp fields cross the record-store boundary as epoch milliseconds so
//! that equality/range filters and ordering behave the same in every store
//! backend. Conversion happens here, at (de)serialization time only; the rest
//! of the codebase works with `DateTime<Utc>`.

pub use chrono::serde::{ts_milliseconds, ts_milliseconds_option};

pub mod ts_milliseconds_vec {
    use chrono::{DateTime, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(dates: &[DateTime<Utc>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(dates.iter().map(|date| date.timestamp_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Vec::<i64>::deserialize(deserializer)?;
        millis
            .into_iter()
            .map(|value| {
                DateTime::<Utc>::from_timestamp_millis(value)
                    .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {value}")))
            })
            .collect()
    }
}
