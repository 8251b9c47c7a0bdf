use chrono::{DateTime, Utc};

use crate::collect::{Attribute, DataCategory, FetchError, Record, SourcePlugin};

/// Deterministic source that fabricates `records_per_window` records for
/// every window, spread evenly from the window start.
///
/// The same window always yields the same records, which keeps agent smoke
/// runs and tests reproducible.
#[derive(Debug, Clone)]
pub struct SyntheticPlugin {
    name: String,
    data_type: String,
    category: DataCategory,
    records_per_window: usize,
}

impl SyntheticPlugin {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, category: DataCategory) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            category,
            records_per_window: 1,
        }
    }

    pub fn with_records_per_window(mut self, n: usize) -> Self {
        self.records_per_window = n;
        self
    }

    pub fn records_for(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Record> {
        if end <= start || self.records_per_window == 0 {
            return Vec::new();
        }

        let step = (end - start) / self.records_per_window as i32;
        (0..self.records_per_window)
            .map(|i| {
                let timestamp = start + step * i as i32;
                let record = Record::new(timestamp)
                    .with_attribute(Attribute::new("source", self.name.as_str()))
                    .with_attribute(Attribute::new("series", format!("series-{i}")));

                match self.category {
                    DataCategory::TimeSeries => record.with_value(synthetic_value(timestamp, i)),
                    DataCategory::Notification => record.with_description(format!(
                        "synthetic event {i} at {}",
                        timestamp.to_rfc3339()
                    )),
                }
            })
            .collect()
    }
}

fn synthetic_value(timestamp: DateTime<Utc>, series: usize) -> f64 {
    let secs = timestamp.timestamp().rem_euclid(3600) as f64;
    (secs / 36.0) + series as f64
}

impl SourcePlugin for SyntheticPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn data_type(&self) -> &str {
        &self.data_type
    }

    fn category(&self) -> DataCategory {
        self.category
    }

    async fn fetch(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _hint_interval_secs: u64,
    ) -> Result<Vec<Record>, FetchError> {
        Ok(self.records_for(start, end))
    }
}
