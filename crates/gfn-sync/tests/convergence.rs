use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use gfn_adapters::{AdapterError, ExtractedPage, FootprintSource, MockSource};
use gfn_core::{Disposition, FootprintRecord, MeasureVocabulary, RecordKey, SummaryKey};
use gfn_storage::{FootprintTable, MemoryTable, SqliteTable};
use gfn_sync::{
    summarize, AggregationPropagator, BackfillCoordinator, BackfillRequest, BatchDeduplicator,
    MergeReconciler, SyncError,
};
use uuid::Uuid;

fn at(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single()
}

fn rec(entity_code: i64, period: i32, measure: &str, stamp: i64, value: f64) -> FootprintRecord {
    let mut record = FootprintRecord::with_key(RecordKey::new(entity_code, period, measure));
    record.entity_name = Some(format!("entity-{entity_code}"));
    record.aggregate_value = Some(value);
    record.transformed_at = at(stamp);
    record
}

async fn tables() -> Vec<(&'static str, Arc<dyn FootprintTable>)> {
    vec![
        ("memory", Arc::new(MemoryTable::new()) as Arc<dyn FootprintTable>),
        ("sqlite", Arc::new(SqliteTable::in_memory().await.expect("in-memory sqlite")) as Arc<dyn FootprintTable>),
    ]
}

async fn merge(table: &Arc<dyn FootprintTable>, batch: Vec<FootprintRecord>) -> gfn_sync::MergeOutcome {
    let batch = BatchDeduplicator.deduplicate(batch);
    MergeReconciler::new(Arc::clone(table)).merge(&batch).await.expect("merge")
}

/// Live records without the reconciler's wall-clock `updated_at`.
async fn state(table: &Arc<dyn FootprintTable>) -> Vec<FootprintRecord> {
    table
        .scan_records()
        .await
        .expect("scan records")
        .into_iter()
        .map(|live| live.record)
        .collect()
}

#[tokio::test]
async fn merging_the_same_batch_twice_is_idempotent() {
    for (name, table) in tables().await {
        let batch = vec![
            rec(1, 2020, "EFConsTotGHA", 10, 1.0),
            rec(1, 2020, "BiocapTotGHA", 10, 2.0),
            rec(2, 2021, "EFConsTotGHA", 11, 3.0),
        ];
        let first = merge(&table, batch.clone()).await;
        assert_eq!(first.counts().inserted, 3, "{name}");
        let snapshot = table.scan_records().await.expect("scan records");

        let second = merge(&table, batch).await;
        assert_eq!(second.counts().skipped, 3, "{name}");
        assert_eq!(second.counts().changed(), 0, "{name}");
        assert!(second.touched().is_empty(), "{name}");
        assert_eq!(table.scan_records().await.expect("scan records"), snapshot, "{name}");
    }
}

#[tokio::test]
async fn live_stamp_is_the_maximum_ever_offered() {
    let offers = [5_i64, 2, 9, 9, 1, 7, 3];
    for (name, table) in tables().await {
        for (i, stamp) in offers.iter().enumerate() {
            merge(&table, vec![rec(1, 2020, "EFConsTotGHA", *stamp, i as f64)]).await;
            let live = table
                .record(&RecordKey::new(1, 2020, "EFConsTotGHA"))
                .await
                .expect("lookup")
                .expect("row present");
            let max = offers[..=i].iter().max().copied().expect("non-empty");
            assert_eq!(live.record.transformed_at, at(max), "{name} after offer {i}");
        }
        // First offer at the maximum stamp wins; the later equal offer is stale.
        let live = table
            .record(&RecordKey::new(1, 2020, "EFConsTotGHA"))
            .await
            .expect("lookup")
            .expect("row present");
        assert_eq!(live.record.aggregate_value, Some(2.0), "{name}");
    }
}

#[tokio::test]
async fn adjacent_ranges_converge_in_any_order() {
    let b1 = vec![
        rec(1, 2018, "EFConsTotGHA", 3, 1.0),
        rec(1, 2019, "EFConsTotGHA", 4, 2.0),
        rec(2, 2019, "BiocapTotGHA", 1, 3.0),
    ];
    let b2 = vec![
        rec(1, 2020, "EFConsTotGHA", 2, 4.0),
        rec(2, 2021, "BiocapTotGHA", 6, 5.0),
    ];
    let union: Vec<_> = b1.iter().chain(&b2).cloned().collect();

    for (name, _) in tables().await {
        let mut states = Vec::new();
        for order in [vec![b1.clone(), b2.clone()], vec![b2.clone(), b1.clone()], vec![union.clone()]] {
            let table: Arc<dyn FootprintTable> = if name == "memory" {
                Arc::new(MemoryTable::new())
            } else {
                Arc::new(SqliteTable::in_memory().await.expect("in-memory sqlite"))
            };
            for batch in order {
                merge(&table, batch).await;
            }
            states.push(state(&table).await);
        }
        assert_eq!(states[0], states[1], "{name}");
        assert_eq!(states[0], states[2], "{name}");
        assert_eq!(states[0].len(), 5, "{name}");
    }
}

#[tokio::test]
async fn propagated_summaries_match_pure_recomputation() {
    let vocabulary = Arc::new(MeasureVocabulary::gfn_default());
    let key = SummaryKey { entity_code: 1, period: 2020 };
    for (name, table) in tables().await {
        let outcome = merge(
            &table,
            vec![
                rec(1, 2020, "EFConsTotGHA", 1, 9.0),
                rec(1, 2020, "BiocapTotGHA", 1, 3.0),
                rec(1, 2020, "EFConsPerCap", 1, 4.5),
            ],
        )
        .await;
        let propagator = AggregationPropagator::new(Arc::clone(&table), Arc::clone(&vocabulary));
        propagator.propagate(&outcome.touched()).await.expect("propagate");

        let live: Vec<_> = state(&table).await;
        let expected = summarize(key, &live, &vocabulary);
        assert_eq!(table.summary(key).await.expect("summary"), Some(expected.clone()), "{name}");
        assert_eq!(expected.ecological_deficit, Some(6.0), "{name}");

        let again = propagator.recompute(key).await.expect("recompute");
        assert_eq!(
            serde_json::to_vec(&again).expect("to vec"),
            serde_json::to_vec(&Some(expected)).expect("to vec"),
            "{name}"
        );
    }
}

#[test]
fn repeated_identity_resolves_to_the_same_winner() {
    let arrivals = vec![
        rec(1, 2020, "A", 5, 1.0),
        rec(1, 2020, "A", 7, 2.0),
        rec(1, 2020, "A", 7, 3.0),
        rec(1, 2020, "A", 6, 4.0),
    ];
    let winners: BTreeSet<_> = (0..10)
        .map(|_| {
            let batch = BatchDeduplicator.deduplicate(arrivals.clone());
            let winner = batch.get(&RecordKey::new(1, 2020, "A")).expect("present");
            winner.aggregate_value.map(f64::to_bits)
        })
        .collect();
    assert_eq!(winners, BTreeSet::from([Some(3.0_f64.to_bits())]));
}

#[tokio::test]
async fn newer_duplicate_in_one_batch_is_inserted_then_skipped() {
    for (name, table) in tables().await {
        let batch = vec![rec(1, 2020, "A", 1, 10.0), rec(1, 2020, "A", 2, 20.0)];
        let deduped = BatchDeduplicator.deduplicate(batch.clone());
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped.collapsed(), 1);

        let key = RecordKey::new(1, 2020, "A");
        let first = merge(&table, batch.clone()).await;
        assert_eq!(first.disposition(&key), Some(Disposition::Inserted), "{name}");
        let live = table.record(&key).await.expect("lookup").expect("row present");
        assert_eq!(live.record.aggregate_value, Some(20.0), "{name}");

        let second = merge(&table, batch).await;
        assert_eq!(second.disposition(&key), Some(Disposition::STALE), "{name}");
    }
}

#[tokio::test]
async fn older_candidate_is_skipped_and_table_unchanged() {
    for (name, table) in tables().await {
        merge(&table, vec![rec(2, 2021, "B", 5, 5.0)]).await;
        let before = table.scan_records().await.expect("scan records");

        let outcome = merge(&table, vec![rec(2, 2021, "B", 3, 99.0)]).await;
        assert_eq!(
            outcome.disposition(&RecordKey::new(2, 2021, "B")),
            Some(Disposition::STALE),
            "{name}"
        );
        assert_eq!(table.scan_records().await.expect("scan records"), before, "{name}");
    }
}

#[tokio::test]
async fn full_refresh_updates_every_existing_key_for_the_period() {
    for (name, table) in tables().await {
        let coordinator = BackfillCoordinator::new(Arc::new(MockSource), Arc::clone(&table));
        let first = coordinator
            .run(Uuid::new_v4(), BackfillRequest::new(2020, 2020))
            .await
            .expect("run");
        assert_eq!(first.counts.inserted, 8, "{name}");

        // Push one live row far into the future; the refresh must still win.
        let mut future = table
            .record(&RecordKey::new(1, 2020, "EFConsTotGHA"))
            .await
            .expect("lookup")
            .expect("row present")
            .record;
        future.transformed_at = Some(gfn_core::storage_precision(Utc::now() + Duration::days(30)));
        table.merge_record(&future, Utc::now()).await.expect("merge record");

        let refresh = coordinator
            .run(Uuid::new_v4(), BackfillRequest::new(2020, 2020).replacing())
            .await
            .expect("run");
        assert_eq!(refresh.counts.updated, 8, "{name}");
        assert_eq!(refresh.counts.inserted, 0, "{name}");
        assert!(refresh.replace_stamp > future.transformed_at, "{name}");
        assert_eq!(table.counts().await.expect("counts").records, 8, "{name}");
    }
}

#[tokio::test]
async fn concurrent_reconcilers_converge_to_the_freshest_rows() {
    for (name, table) in tables().await {
        let mut tasks = Vec::new();
        for writer in 0..6_i64 {
            let table = Arc::clone(&table);
            tasks.push(tokio::spawn(async move {
                // Writers disagree on which version of each key is newest.
                let batch: Vec<_> = (0..4)
                    .map(|entity| {
                        let stamp = (writer * 7 + entity * 3) % 11;
                        rec(entity, 2020, "EFConsTotGHA", stamp, (writer * 100 + stamp) as f64)
                    })
                    .collect();
                let batch = BatchDeduplicator.deduplicate(batch);
                MergeReconciler::new(table).merge(&batch).await.expect("merge")
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }

        for entity in 0..4_i64 {
            let best = (0..6_i64).map(|writer| (writer * 7 + entity * 3) % 11).max().expect("non-empty");
            let live = table
                .record(&RecordKey::new(entity, 2020, "EFConsTotGHA"))
                .await
                .expect("lookup")
                .expect("row present");
            assert_eq!(live.record.transformed_at, at(best), "{name} entity {entity}");
        }
        assert_eq!(table.counts().await.expect("counts").records, 4, "{name}");
    }
}

/// Mock rows, except for the periods listed as failing.
struct FlakySource {
    failing: Vec<i32>,
}

#[async_trait]
impl FootprintSource for FlakySource {
    fn source_id(&self) -> &'static str {
        "flaky"
    }

    async fn extract_period(&self, run_id: Uuid, period: i32) -> Result<ExtractedPage, AdapterError> {
        if self.failing.contains(&period) {
            return Err(AdapterError::Message(format!("upstream unavailable for {period}")));
        }
        MockSource.extract_period(run_id, period).await
    }
}

#[tokio::test]
async fn failed_periods_are_reported_while_the_rest_commit() {
    let table: Arc<dyn FootprintTable> = Arc::new(MemoryTable::new());
    let source = Arc::new(FlakySource { failing: vec![2019, 2020, 2022] });
    let report = BackfillCoordinator::new(source, Arc::clone(&table))
        .run(Uuid::new_v4(), BackfillRequest::new(2018, 2022))
        .await
        .expect("run");

    assert!(report.is_partial());
    assert_eq!(report.succeeded_periods, vec![2018, 2021]);
    assert_eq!(report.retry_ranges(), vec![(2019, 2020), (2022, 2022)]);
    assert_eq!(report.counts.inserted, 16);
    assert!(table
        .summary(SummaryKey { entity_code: 1, period: 2021 })
        .await
        .expect("summary")
        .is_some());
}

#[tokio::test]
async fn every_period_failing_is_a_hard_error() {
    let table: Arc<dyn FootprintTable> = Arc::new(MemoryTable::new());
    let source = Arc::new(FlakySource { failing: vec![2019, 2020] });
    let err = BackfillCoordinator::new(source, Arc::clone(&table))
        .run(Uuid::new_v4(), BackfillRequest::new(2019, 2020))
        .await
        .unwrap_err();

    match err {
        SyncError::ExtractionFailed { start, end, failures } => {
            assert_eq!((start, end), (2019, 2020));
            assert_eq!(failures.len(), 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(table.counts().await.expect("counts").records, 0);
}
