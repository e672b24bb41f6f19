//! Append-only token accounting, one row per distillation operation.

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::MetricId;
use crate::persistence::{prefix_range, tables, Store};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestionMetric {
    pub id: MetricId,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub facts_extracted: u64,
    pub recorded_at: DateTime<Utc>,
}

pub fn record_metric(store: &Store, input_tokens: u64, output_tokens: u64, facts_extracted: u64) -> Result<MetricId> {
    let metric = IngestionMetric {
        id: MetricId::new(),
        input_tokens,
        output_tokens,
        facts_extracted,
        recorded_at: Utc::now(),
    };
    let txn = store.begin_write()?;
    {
        let mut table = txn.open_table(tables::INGESTION_METRICS)?;
        table.insert(metric.id.0.as_str(), serde_json::to_string(&metric)?.as_str())?;
    }
    txn.commit()?;
    Ok(metric.id)
}

/// Every recorded metric in insertion order — ids are ULIDs, so iterating
/// the table in key order already returns chronological order.
pub fn all_metrics(store: &Store) -> Result<Vec<IngestionMetric>> {
    let txn = store.begin_read()?;
    let table = txn.open_table(tables::INGESTION_METRICS)?;
    let (start, end) = prefix_range("");
    let mut out = Vec::new();
    for entry in table.range(start.as_str()..end.as_str())? {
        let (_, v) = entry?;
        out.push(serde_json::from_str(v.value())?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_recorded_in_insertion_order() {
        let store = Store::open_in_memory().unwrap();
        record_metric(&store, 100, 50, 3).unwrap();
        record_metric(&store, 200, 80, 5).unwrap();
        let all = all_metrics(&store).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].recorded_at <= all[1].recorded_at);
        assert_eq!(all[1].facts_extracted, 5);
    }
}
