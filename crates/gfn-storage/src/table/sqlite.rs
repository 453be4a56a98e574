//! Embedded SQLite destination.
//!
//! Timestamps are stored as integer microseconds since the epoch so the
//! freshness comparison runs inside SQL on plain integers.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gfn_core::{
    Disposition, FootprintRecord, LandUseBreakdown, LiveRecord, MeasureCategory, MeasureTypeInfo,
    QualityScore, RecordKey, ReferenceEntity, SummaryKey, SummaryRow,
};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

use super::{FootprintTable, TableCounts, TableError, TableResult};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS footprint_records (
        entity_code INTEGER NOT NULL,
        period INTEGER NOT NULL,
        measure_type TEXT NOT NULL,
        entity_name TEXT,
        entity_short_name TEXT,
        entity_iso2 TEXT,
        crop_land REAL,
        grazing_land REAL,
        forest_land REAL,
        fishing_ground REAL,
        built_up_land REAL,
        carbon REAL,
        aggregate_value REAL,
        quality_score TEXT NOT NULL,
        derived_percentage REAL,
        extracted_at_us INTEGER,
        transformed_at_us INTEGER,
        source_file TEXT,
        updated_at_us INTEGER NOT NULL,
        PRIMARY KEY (entity_code, period, measure_type)
    )",
    "CREATE TABLE IF NOT EXISTS footprint_summary (
        entity_code INTEGER NOT NULL,
        period INTEGER NOT NULL,
        entity_name TEXT,
        entity_iso2 TEXT,
        ef_consumption_total REAL,
        ef_production_total REAL,
        ef_imports_total REAL,
        ef_exports_total REAL,
        biocapacity_total REAL,
        ef_consumption_per_capita REAL,
        biocapacity_per_capita REAL,
        ecological_deficit REAL,
        deficit_per_capita REAL,
        footprint_to_biocapacity_pct REAL,
        carbon_share_pct REAL,
        crop_land REAL,
        grazing_land REAL,
        forest_land REAL,
        fishing_ground REAL,
        built_up_land REAL,
        carbon REAL,
        measure_count INTEGER NOT NULL,
        latest_transformed_at_us INTEGER,
        PRIMARY KEY (entity_code, period)
    )",
    "CREATE TABLE IF NOT EXISTS reference_entities (
        entity_code INTEGER PRIMARY KEY,
        name TEXT,
        short_name TEXT,
        iso2 TEXT
    )",
    "CREATE TABLE IF NOT EXISTS measure_types (
        measure_type TEXT PRIMARY KEY,
        description TEXT NOT NULL,
        category TEXT NOT NULL,
        is_per_unit INTEGER NOT NULL,
        unit TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_footprint_records_period ON footprint_records (period)",
];

const INSERT_RECORD: &str = "INSERT INTO footprint_records (
        entity_name, entity_short_name, entity_iso2,
        crop_land, grazing_land, forest_land, fishing_ground, built_up_land, carbon,
        aggregate_value, quality_score, derived_percentage,
        extracted_at_us, transformed_at_us, source_file, updated_at_us,
        entity_code, period, measure_type
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (entity_code, period, measure_type) DO NOTHING";

// Compare-and-swap on transformed_at: a NULL candidate never beats a stored
// timestamp, a NULL stored value is always replaced.
const UPDATE_STALE_RECORD: &str = "UPDATE footprint_records SET
        entity_name = ?, entity_short_name = ?, entity_iso2 = ?,
        crop_land = ?, grazing_land = ?, forest_land = ?, fishing_ground = ?,
        built_up_land = ?, carbon = ?,
        aggregate_value = ?, quality_score = ?, derived_percentage = ?,
        extracted_at_us = ?, transformed_at_us = ?, source_file = ?, updated_at_us = ?
    WHERE entity_code = ? AND period = ? AND measure_type = ?
      AND (transformed_at_us IS NULL OR transformed_at_us < ?)";

const INSERT_SUMMARY: &str = "INSERT INTO footprint_summary (
        entity_name, entity_iso2,
        ef_consumption_total, ef_production_total, ef_imports_total, ef_exports_total,
        biocapacity_total, ef_consumption_per_capita, biocapacity_per_capita,
        ecological_deficit, deficit_per_capita, footprint_to_biocapacity_pct, carbon_share_pct,
        crop_land, grazing_land, forest_land, fishing_ground, built_up_land, carbon,
        measure_count, latest_transformed_at_us,
        entity_code, period
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (entity_code, period) DO NOTHING";

const UPDATE_SUMMARY: &str = "UPDATE footprint_summary SET
        entity_name = ?, entity_iso2 = ?,
        ef_consumption_total = ?, ef_production_total = ?, ef_imports_total = ?,
        ef_exports_total = ?, biocapacity_total = ?, ef_consumption_per_capita = ?,
        biocapacity_per_capita = ?, ecological_deficit = ?, deficit_per_capita = ?,
        footprint_to_biocapacity_pct = ?, carbon_share_pct = ?,
        crop_land = ?, grazing_land = ?, forest_land = ?, fishing_ground = ?,
        built_up_land = ?, carbon = ?,
        measure_count = ?, latest_transformed_at_us = ?
    WHERE entity_code = ? AND period = ?";

#[derive(Debug, Clone)]
pub struct SqliteTable {
    pool: Pool<Sqlite>,
}

impl SqliteTable {
    /// Open (creating if missing) a database file and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> TableResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| TableError::Database(err.into()))?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;
        let table = Self { pool };
        table.migrate().await?;
        Ok(table)
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> TableResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let table = Self { pool };
        table.migrate().await?;
        Ok(table)
    }

    pub async fn migrate(&self) -> TableResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("sqlite schema applied");
        Ok(())
    }
}

fn to_micros(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp_micros())
}

fn from_micros(key: &dyn std::fmt::Display, us: Option<i64>) -> TableResult<Option<DateTime<Utc>>> {
    us.map(|us| {
        DateTime::from_timestamp_micros(us).ok_or_else(|| TableError::Corrupt {
            key: key.to_string(),
            message: format!("timestamp out of range: {us}"),
        })
    })
    .transpose()
}

fn bind_components<'q>(query: SqliteQuery<'q>, c: &LandUseBreakdown) -> SqliteQuery<'q> {
    query
        .bind(c.crop_land)
        .bind(c.grazing_land)
        .bind(c.forest_land)
        .bind(c.fishing_ground)
        .bind(c.built_up_land)
        .bind(c.carbon)
}

/// Binds every mutable column followed by the identity, matching both record statements.
fn bind_record<'q>(
    query: SqliteQuery<'q>,
    record: &'q FootprintRecord,
    now: DateTime<Utc>,
) -> SqliteQuery<'q> {
    let query = query
        .bind(record.entity_name.as_deref())
        .bind(record.entity_short_name.as_deref())
        .bind(record.entity_iso2.as_deref());
    bind_components(query, &record.components)
        .bind(record.aggregate_value)
        .bind(record.quality_score.as_str())
        .bind(record.derived_percentage)
        .bind(to_micros(record.extracted_at))
        .bind(to_micros(record.transformed_at))
        .bind(record.source_file.as_deref())
        .bind(now.timestamp_micros())
        .bind(record.key.entity_code)
        .bind(record.key.period)
        .bind(record.key.measure_type.as_str())
}

fn bind_summary<'q>(query: SqliteQuery<'q>, row: &'q SummaryRow) -> SqliteQuery<'q> {
    let query = query
        .bind(row.entity_name.as_deref())
        .bind(row.entity_iso2.as_deref())
        .bind(row.ef_consumption_total)
        .bind(row.ef_production_total)
        .bind(row.ef_imports_total)
        .bind(row.ef_exports_total)
        .bind(row.biocapacity_total)
        .bind(row.ef_consumption_per_capita)
        .bind(row.biocapacity_per_capita)
        .bind(row.ecological_deficit)
        .bind(row.deficit_per_capita)
        .bind(row.footprint_to_biocapacity_pct)
        .bind(row.carbon_share_pct);
    bind_components(query, &row.components)
        .bind(i64::from(row.measure_count))
        .bind(to_micros(row.latest_transformed_at))
        .bind(row.key.entity_code)
        .bind(row.key.period)
}

fn components_from_row(row: &SqliteRow) -> Result<LandUseBreakdown, sqlx::Error> {
    Ok(LandUseBreakdown {
        crop_land: row.try_get("crop_land")?,
        grazing_land: row.try_get("grazing_land")?,
        forest_land: row.try_get("forest_land")?,
        fishing_ground: row.try_get("fishing_ground")?,
        built_up_land: row.try_get("built_up_land")?,
        carbon: row.try_get("carbon")?,
    })
}

fn live_record_from_row(row: &SqliteRow) -> TableResult<LiveRecord> {
    let key = RecordKey::new(
        row.try_get::<i64, _>("entity_code")?,
        row.try_get::<i32, _>("period")?,
        row.try_get::<String, _>("measure_type")?,
    );
    let quality: String = row.try_get("quality_score")?;
    let updated_at = from_micros(&key, Some(row.try_get("updated_at_us")?))?.ok_or_else(|| {
        TableError::Corrupt {
            key: key.to_string(),
            message: "missing updated_at".to_string(),
        }
    })?;
    let record = FootprintRecord {
        entity_name: row.try_get("entity_name")?,
        entity_short_name: row.try_get("entity_short_name")?,
        entity_iso2: row.try_get("entity_iso2")?,
        components: components_from_row(row)?,
        aggregate_value: row.try_get("aggregate_value")?,
        quality_score: QualityScore::parse(&quality),
        derived_percentage: row.try_get("derived_percentage")?,
        extracted_at: from_micros(&key, row.try_get("extracted_at_us")?)?,
        transformed_at: from_micros(&key, row.try_get("transformed_at_us")?)?,
        source_file: row.try_get("source_file")?,
        key,
    };
    Ok(LiveRecord { record, updated_at })
}

fn summary_from_row(row: &SqliteRow) -> TableResult<SummaryRow> {
    let key = SummaryKey {
        entity_code: row.try_get("entity_code")?,
        period: row.try_get("period")?,
    };
    let measure_count: i64 = row.try_get("measure_count")?;
    Ok(SummaryRow {
        entity_name: row.try_get("entity_name")?,
        entity_iso2: row.try_get("entity_iso2")?,
        ef_consumption_total: row.try_get("ef_consumption_total")?,
        ef_production_total: row.try_get("ef_production_total")?,
        ef_imports_total: row.try_get("ef_imports_total")?,
        ef_exports_total: row.try_get("ef_exports_total")?,
        biocapacity_total: row.try_get("biocapacity_total")?,
        ef_consumption_per_capita: row.try_get("ef_consumption_per_capita")?,
        biocapacity_per_capita: row.try_get("biocapacity_per_capita")?,
        ecological_deficit: row.try_get("ecological_deficit")?,
        deficit_per_capita: row.try_get("deficit_per_capita")?,
        footprint_to_biocapacity_pct: row.try_get("footprint_to_biocapacity_pct")?,
        carbon_share_pct: row.try_get("carbon_share_pct")?,
        components: components_from_row(row)?,
        measure_count: u32::try_from(measure_count).map_err(|_| TableError::Corrupt {
            key: key.to_string(),
            message: format!("measure_count out of range: {measure_count}"),
        })?,
        latest_transformed_at: from_micros(&key, row.try_get("latest_transformed_at_us")?)?,
        key,
    })
}

#[async_trait]
impl FootprintTable for SqliteTable {
    async fn merge_record(
        &self,
        candidate: &FootprintRecord,
        now: DateTime<Utc>,
    ) -> TableResult<Disposition> {
        let inserted = bind_record(sqlx::query(INSERT_RECORD), candidate, now)
            .execute(&self.pool)
            .await?;
        if inserted.rows_affected() == 1 {
            return Ok(Disposition::Inserted);
        }

        let updated = bind_record(sqlx::query(UPDATE_STALE_RECORD), candidate, now)
            .bind(to_micros(candidate.transformed_at))
            .execute(&self.pool)
            .await?;
        Ok(if updated.rows_affected() == 1 {
            Disposition::Updated
        } else {
            Disposition::STALE
        })
    }

    async fn record(&self, key: &RecordKey) -> TableResult<Option<LiveRecord>> {
        sqlx::query(
            "SELECT * FROM footprint_records
             WHERE entity_code = ? AND period = ? AND measure_type = ?",
        )
        .bind(key.entity_code)
        .bind(key.period)
        .bind(key.measure_type.as_str())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(live_record_from_row)
        .transpose()
    }

    async fn records_for(&self, key: SummaryKey) -> TableResult<Vec<LiveRecord>> {
        sqlx::query(
            "SELECT * FROM footprint_records
             WHERE entity_code = ? AND period = ?
             ORDER BY measure_type",
        )
        .bind(key.entity_code)
        .bind(key.period)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(live_record_from_row)
        .collect()
    }

    async fn scan_records(&self) -> TableResult<Vec<LiveRecord>> {
        sqlx::query("SELECT * FROM footprint_records ORDER BY entity_code, period, measure_type")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(live_record_from_row)
            .collect()
    }

    async fn upsert_summary(&self, row: &SummaryRow) -> TableResult<Disposition> {
        let inserted = bind_summary(sqlx::query(INSERT_SUMMARY), row)
            .execute(&self.pool)
            .await?;
        if inserted.rows_affected() == 1 {
            return Ok(Disposition::Inserted);
        }
        bind_summary(sqlx::query(UPDATE_SUMMARY), row)
            .execute(&self.pool)
            .await?;
        Ok(Disposition::Updated)
    }

    async fn summary(&self, key: SummaryKey) -> TableResult<Option<SummaryRow>> {
        sqlx::query("SELECT * FROM footprint_summary WHERE entity_code = ? AND period = ?")
            .bind(key.entity_code)
            .bind(key.period)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(summary_from_row)
            .transpose()
    }

    async fn upsert_entity(&self, entity: &ReferenceEntity) -> TableResult<()> {
        sqlx::query(
            "INSERT INTO reference_entities (entity_code, name, short_name, iso2)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (entity_code) DO UPDATE SET
                 name = COALESCE(excluded.name, name),
                 short_name = COALESCE(excluded.short_name, short_name),
                 iso2 = COALESCE(excluded.iso2, iso2)",
        )
        .bind(entity.entity_code)
        .bind(entity.name.as_deref())
        .bind(entity.short_name.as_deref())
        .bind(entity.iso2.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn entity(&self, entity_code: i64) -> TableResult<Option<ReferenceEntity>> {
        let row = sqlx::query("SELECT * FROM reference_entities WHERE entity_code = ?")
            .bind(entity_code)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> TableResult<ReferenceEntity> {
            Ok(ReferenceEntity {
                entity_code: row.try_get("entity_code")?,
                name: row.try_get("name")?,
                short_name: row.try_get("short_name")?,
                iso2: row.try_get("iso2")?,
            })
        })
        .transpose()
    }

    async fn upsert_measure_type(&self, info: &MeasureTypeInfo) -> TableResult<()> {
        sqlx::query(
            "INSERT INTO measure_types (measure_type, description, category, is_per_unit, unit)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (measure_type) DO UPDATE SET
                 description = excluded.description,
                 category = excluded.category,
                 is_per_unit = excluded.is_per_unit,
                 unit = excluded.unit",
        )
        .bind(info.measure_type.as_str())
        .bind(info.description.as_str())
        .bind(info.category.as_str())
        .bind(info.is_per_unit)
        .bind(info.unit.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn measure_type(&self, measure_type: &str) -> TableResult<Option<MeasureTypeInfo>> {
        let row = sqlx::query("SELECT * FROM measure_types WHERE measure_type = ?")
            .bind(measure_type)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> TableResult<MeasureTypeInfo> {
            let category: String = row.try_get("category")?;
            Ok(MeasureTypeInfo {
                measure_type: row.try_get("measure_type")?,
                description: row.try_get("description")?,
                category: MeasureCategory::parse(&category).ok_or_else(|| TableError::Corrupt {
                    key: measure_type.to_string(),
                    message: format!("unknown category {category}"),
                })?,
                is_per_unit: row.try_get("is_per_unit")?,
                unit: row.try_get("unit")?,
            })
        })
        .transpose()
    }

    async fn max_transformed_at(
        &self,
        start_period: i32,
        end_period: i32,
    ) -> TableResult<Option<DateTime<Utc>>> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(transformed_at_us) FROM footprint_records WHERE period BETWEEN ? AND ?",
        )
        .bind(start_period)
        .bind(end_period)
        .fetch_one(&self.pool)
        .await?;
        from_micros(&format!("periods {start_period}..={end_period}"), max)
    }

    async fn counts(&self) -> TableResult<TableCounts> {
        let mut counts = TableCounts::default();
        for (table, slot) in [
            ("footprint_records", &mut counts.records),
            ("footprint_summary", &mut counts.summaries),
            ("reference_entities", &mut counts.entities),
            ("measure_types", &mut counts.measure_types),
        ] {
            let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await?;
            *slot = n.max(0) as u64;
        }
        Ok(counts)
    }
}
