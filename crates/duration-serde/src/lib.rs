//! Serialize and deserialize `std::time::Duration` config fields.
//! Accepts humantime strings ("5 minutes", "30s") as well as plain
//! integers, which are taken to be seconds. Serializes to the humantime
//! string form.
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

struct DurationVisitor;

impl serde::de::Visitor<'_> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str("a duration string or a number of seconds")
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Duration, E> {
        Ok(Duration::from_secs(v))
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Duration, E> {
        u64::try_from(v)
            .map(Duration::from_secs)
            .map_err(|_| E::custom("duration seconds must not be negative"))
    }

    fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Duration, E> {
        if v < 0.0 {
            return Err(E::custom("duration seconds must not be negative"));
        }
        Ok(Duration::from_secs_f64(v))
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Duration, E> {
        humantime::parse_duration(v)
            .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
    }
}

pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    d.deserialize_any(DurationVisitor)
}

pub fn serialize<S>(duration: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    humantime::format_duration(*duration)
        .to_string()
        .serialize(s)
}

/// For `Option<Duration>` fields; use via `#[serde(with = "duration_serde::opt")]`
pub mod opt {
    use super::*;

    #[derive(Deserialize)]
    struct Wrap(#[serde(deserialize_with = "super::deserialize")] Duration);

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Wrap>::deserialize(d)?.map(|w| w.0))
    }

    pub fn serialize<S>(duration: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => s.serialize_some(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super")]
        timeout: Duration,
    }

    #[test]
    fn parses_strings() {
        let s: Sample = serde_json::from_str(r#"{"timeout": "5 minutes"}"#).unwrap();
        assert_eq!(s.timeout, Duration::from_secs(300));
    }

    #[test]
    fn parses_integers_as_seconds() {
        let s: Sample = serde_json::from_str(r#"{"timeout": 25}"#).unwrap();
        assert_eq!(s.timeout, Duration::from_secs(25));
    }

    #[test]
    fn round_trips() {
        let s: Sample = serde_json::from_str(r#"{"timeout": 90}"#).unwrap();
        assert_eq!(serde_json::to_string(&s).unwrap(), r#"{"timeout":"1m 30s"}"#);
    }
}
