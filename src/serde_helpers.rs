use serde::{Deserialize, Deserializer, Serializer};
use time::{
    OffsetDateTime, PrimitiveDateTime,
    format_description::{BorrowedFormatItem, well_known::Rfc3339},
    macros::format_description,
};

/// Serde helpers for artifact timestamps.
///
/// Output format: RFC 3339 (e.g. `2025-01-02T03:04:05Z`).
/// Input also accepts `YYYY-mm-dd HH:MM:SS`, read as UTC.
pub mod offset_datetime {

    use super::*;

    pub(super) const LOOSE_FORMAT: &[BorrowedFormatItem] = format_description!(
        "[year]-[month padding:zero]-[day padding:zero] [hour padding:zero]:[minute padding:zero]:[second padding:zero]"
    );

    pub fn serialize<S>(dt: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.format(&Rfc3339).map_err(serde::ser::Error::custom)?)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        OffsetDateTime::parse(&raw, &Rfc3339)
            .or_else(|_| PrimitiveDateTime::parse(&raw, LOOSE_FORMAT).map(|pdt| pdt.assume_utc()))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Wrapper {
        #[serde(with = "crate::serde_helpers::offset_datetime")]
        ts: OffsetDateTime,
    }

    #[test]
    fn writes_rfc3339() {
        let dt = PrimitiveDateTime::parse("2024-12-31 23:59:59", offset_datetime::LOOSE_FORMAT)
            .unwrap()
            .assume_utc();
        let serialized = serde_json::to_string(&Wrapper { ts: dt }).unwrap();
        assert_eq!(serialized, "{\"ts\":\"2024-12-31T23:59:59Z\"}");
    }

    #[test]
    fn reads_both_formats() {
        let a: Wrapper = serde_json::from_str("{\"ts\":\"2024-12-31T23:59:59Z\"}").unwrap();
        let b: Wrapper = serde_json::from_str("{\"ts\":\"2024-12-31 23:59:59\"}").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_json::from_str::<Wrapper>("{\"ts\":\"yesterday\"}").is_err());
    }
}
