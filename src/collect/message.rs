use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Batch, Record};

/// JSON body of one outbound message.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub data_type: &'a str,
    pub source: &'a str,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub records: &'a [Record],
}

impl<'a> Envelope<'a> {
    pub fn new(kind: &'a str, batch: &'a Batch<'a>, records: &'a [Record]) -> Self {
        Self {
            kind,
            data_type: batch.data_type,
            source: batch.source,
            window_start: batch.window.start,
            window_end: batch.window.end,
            records,
        }
    }
}

/// Serialize `records` from `batch` as one message body.
pub fn encode(kind: &str, batch: &Batch<'_>, records: &[Record]) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope::new(kind, batch, records))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::collect::{Attribute, DataCategory};
    use crate::query::QueryWindow;

    #[test]
    fn test_envelope_fields() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let records = vec![Record::new(start)
            .with_attribute(Attribute::new("host", "a"))
            .with_value(1.5)];
        let batch = Batch {
            source: "cpu",
            data_type: "cpu_load",
            category: DataCategory::TimeSeries,
            window: QueryWindow::new(start, end),
            records,
        };

        let text = encode("internal_time_series", &batch, &batch.records).expect("encode");
        let json: serde_json::Value = serde_json::from_str(&text).expect("valid json");

        assert_eq!(json["type"], "internal_time_series");
        assert_eq!(json["data_type"], "cpu_load");
        assert_eq!(json["source"], "cpu");
        assert_eq!(json["window_start"], "2024-01-01T00:00:00Z");
        assert_eq!(json["records"][0]["value"], 1.5);
        assert_eq!(json["records"][0]["attributes"][0]["name"], "host");
        assert!(!text.contains('\0'));
    }
}
