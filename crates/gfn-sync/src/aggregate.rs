//! Aggregation propagator: scoped recomputation of summary rows.

use std::collections::BTreeSet;
use std::sync::Arc;

use gfn_adapters::derived_percentage;
use gfn_core::{FootprintRecord, MeasureVocabulary, SummaryColumn, SummaryKey, SummaryRow};
use gfn_storage::{FootprintTable, TableError};
use tracing::{debug, info};

/// Pure recomputation of one summary row from its live records.
///
/// Records are read in identity order, so the first record carrying an
/// entity name supplies the row's labels.
pub fn summarize<'a>(
    key: SummaryKey,
    records: impl IntoIterator<Item = &'a FootprintRecord>,
    vocabulary: &MeasureVocabulary,
) -> SummaryRow {
    let mut row = SummaryRow::empty(key);
    let mut breakdown_total = None;
    for record in records {
        row.measure_count += 1;
        row.latest_transformed_at = row.latest_transformed_at.max(record.transformed_at);
        if row.entity_name.is_none() {
            row.entity_name = record.entity_name.clone();
        }
        if row.entity_iso2.is_none() {
            row.entity_iso2 = record.entity_iso2.clone();
        }
        if let Some(column) = vocabulary.summary_column(&record.key.measure_type) {
            row.set_column(column, record.aggregate_value);
        }
        if record.key.measure_type == vocabulary.breakdown_measure {
            row.components = record.components;
            breakdown_total = record.aggregate_value;
        }
    }

    let footprint = row.column(SummaryColumn::EfConsumptionTotal);
    let biocapacity = row.column(SummaryColumn::BiocapacityTotal);
    row.ecological_deficit = difference(footprint, biocapacity);
    row.deficit_per_capita = difference(
        row.column(SummaryColumn::EfConsumptionPerCapita),
        row.column(SummaryColumn::BiocapacityPerCapita),
    );
    row.footprint_to_biocapacity_pct = derived_percentage(footprint, biocapacity);
    row.carbon_share_pct = derived_percentage(row.components.carbon, breakdown_total);
    row
}

fn difference(minuend: Option<f64>, subtrahend: Option<f64>) -> Option<f64> {
    Some(minuend? - subtrahend?)
}

#[derive(Clone)]
pub struct AggregationPropagator {
    table: Arc<dyn FootprintTable>,
    vocabulary: Arc<MeasureVocabulary>,
}

impl AggregationPropagator {
    pub fn new(table: Arc<dyn FootprintTable>, vocabulary: Arc<MeasureVocabulary>) -> Self {
        Self { table, vocabulary }
    }

    /// Current summary for `key`, or `None` when no live record exists.
    pub async fn recompute(&self, key: SummaryKey) -> Result<Option<SummaryRow>, TableError> {
        let live = self.table.records_for(key).await?;
        if live.is_empty() {
            return Ok(None);
        }
        Ok(Some(summarize(
            key,
            live.iter().map(|l| &l.record),
            &self.vocabulary,
        )))
    }

    /// Recomputes and overwrites the summary of every touched key.
    pub async fn propagate(&self, touched: &BTreeSet<SummaryKey>) -> Result<Vec<SummaryRow>, TableError> {
        let mut written = Vec::with_capacity(touched.len());
        for key in touched {
            let Some(row) = self.recompute(*key).await? else {
                debug!(%key, "no live records behind touched key");
                continue;
            };
            self.table.upsert_summary(&row).await?;
            written.push(row);
        }
        info!(summaries = written.len(), "summaries propagated");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use gfn_core::RecordKey;
    use gfn_storage::MemoryTable;

    fn rec(measure: &str, value: Option<f64>, carbon: Option<f64>, at: i64) -> FootprintRecord {
        let mut record = FootprintRecord::with_key(RecordKey::new(1, 2020, measure));
        record.entity_name = Some("France".into());
        record.aggregate_value = value;
        record.components.carbon = carbon;
        record.transformed_at = Some(Utc.timestamp_opt(at, 0).single().expect("valid timestamp"));
        record
    }

    const KEY: SummaryKey = SummaryKey { entity_code: 1, period: 2020 };

    #[test]
    fn pivots_totals_and_computes_deficit() {
        let vocab = MeasureVocabulary::gfn_default();
        let records = vec![
            rec("BiocapTotGHA", Some(4.0), None, 2),
            rec("EFConsTotGHA", Some(10.0), Some(6.0), 1),
            rec("Population", Some(67.0), None, 3),
        ];
        let row = summarize(KEY, &records, &vocab);
        assert_eq!(row.ef_consumption_total, Some(10.0));
        assert_eq!(row.biocapacity_total, Some(4.0));
        assert_eq!(row.ecological_deficit, Some(6.0));
        assert_eq!(row.footprint_to_biocapacity_pct, Some(250.0));
        assert_eq!(row.carbon_share_pct, Some(60.0));
        assert_eq!(row.components.carbon, Some(6.0));
        assert_eq!(row.measure_count, 3);
        assert_eq!(row.latest_transformed_at, records[2].transformed_at);
        assert_eq!(row.deficit_per_capita, None);
    }

    #[test]
    fn zero_or_missing_denominators_give_null_percentages() {
        let vocab = MeasureVocabulary::gfn_default();
        let zero = vec![rec("BiocapTotGHA", Some(0.0), None, 1), rec("EFConsTotGHA", Some(0.0), Some(1.0), 1)];
        let row = summarize(KEY, &zero, &vocab);
        assert_eq!(row.footprint_to_biocapacity_pct, None);
        assert_eq!(row.carbon_share_pct, None);
        assert_eq!(row.ecological_deficit, Some(0.0));

        let missing = vec![rec("EFConsTotGHA", Some(3.0), None, 1)];
        let row = summarize(KEY, &missing, &vocab);
        assert_eq!(row.ecological_deficit, None);
        assert_eq!(row.footprint_to_biocapacity_pct, None);
    }

    #[tokio::test]
    async fn recompute_twice_is_identical_and_only_touched_keys_are_written() {
        let table = Arc::new(MemoryTable::new());
        for record in [rec("EFConsTotGHA", Some(10.0), Some(5.0), 1), rec("BiocapTotGHA", Some(2.0), None, 1)] {
            table.merge_record(&record, Utc::now()).await.expect("merge record");
        }
        let propagator = AggregationPropagator::new(table.clone(), Arc::new(MeasureVocabulary::gfn_default()));

        let first = propagator.recompute(KEY).await.expect("recompute");
        let second = propagator.recompute(KEY).await.expect("recompute");
        assert_eq!(first, second);

        let untouched = SummaryKey { entity_code: 9, period: 2020 };
        let written = propagator
            .propagate(&BTreeSet::from([KEY, untouched]))
            .await
            .expect("propagate");
        assert_eq!(written.len(), 1);
        assert_eq!(table.summary(KEY).await.expect("summary"), first);
        assert_eq!(table.summary(untouched).await.expect("summary"), None);
    }
}
