//! Per-record reconciliation and the per-dataset batch over a date range.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use liws_adapters::{AdapterError, DatasetAdapter, RecordKey, RecordSource, WriteMode};
use liws_core::RawRecord;
use liws_storage::Store;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

/// What happened to one raw record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Inserted,
    Updated,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetRunSummary {
    pub dataset: String,
    pub source: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub created_tables: Vec<String>,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DatasetRunSummary {
    fn new(adapter: &dyn DatasetAdapter, from: NaiveDate, to: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            dataset: adapter.key().to_string(),
            source: adapter.target().to_string(),
            from,
            to,
            created_tables: Vec::new(),
            fetched: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn record(&mut self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Inserted => self.inserted += 1,
            ReconcileOutcome::Updated => self.updated += 1,
            ReconcileOutcome::Skipped(_) => self.skipped += 1,
            ReconcileOutcome::Failed(_) => self.failed += 1,
        }
    }
}

async fn write_checked(
    adapter: &dyn DatasetAdapter,
    store: &dyn Store,
    record: &RawRecord,
    key: &RecordKey,
) -> Result<ReconcileOutcome, AdapterError> {
    if adapter.record_exists(store, key).await? {
        adapter.update_record(store, record).await?;
        Ok(ReconcileOutcome::Updated)
    } else {
        adapter.insert_record(store, record).await?;
        Ok(ReconcileOutcome::Inserted)
    }
}

async fn write_insert_or_update(
    adapter: &dyn DatasetAdapter,
    store: &dyn Store,
    record: &RawRecord,
    key: &RecordKey,
) -> Result<ReconcileOutcome, AdapterError> {
    match adapter.insert_record(store, record).await {
        Ok(()) => Ok(ReconcileOutcome::Inserted),
        Err(err) if err.is_unique_violation() => {
            debug!(dataset = adapter.key(), %key, "key exists, updating measure");
            adapter.update_record(store, record).await?;
            Ok(ReconcileOutcome::Updated)
        }
        Err(err) => Err(err),
    }
}

/// Makes the store match one raw record. Never fails: problems become `Skipped` or `Failed`.
pub async fn reconcile(
    adapter: &dyn DatasetAdapter,
    store: &dyn Store,
    record: &RawRecord,
) -> ReconcileOutcome {
    let key = match adapter.record_key(record) {
        Ok(key) => key,
        Err(reason) => {
            warn!(dataset = adapter.key(), %reason, "skipping record");
            return ReconcileOutcome::Skipped(reason);
        }
    };

    let written = match adapter.write_mode() {
        WriteMode::CheckThenWrite => write_checked(adapter, store, record, &key).await,
        WriteMode::InsertOrUpdate => write_insert_or_update(adapter, store, record, &key).await,
    };
    match written {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(dataset = adapter.key(), %key, error = %err, "record failed");
            ReconcileOutcome::Failed(err.to_string())
        }
    }
}

/// One dataset bound to the run's store and record source.
pub struct DatasetSync<'a> {
    adapter: &'a dyn DatasetAdapter,
    store: &'a dyn Store,
    source: &'a dyn RecordSource,
}

impl<'a> DatasetSync<'a> {
    pub fn new(
        adapter: &'a dyn DatasetAdapter,
        store: &'a dyn Store,
        source: &'a dyn RecordSource,
    ) -> Self {
        Self {
            adapter,
            store,
            source,
        }
    }

    pub async fn ensure_schema(&self) -> Result<Vec<String>> {
        self.adapter
            .ensure_schema(self.store)
            .await
            .with_context(|| format!("creating tables for {}", self.adapter.key()))
    }

    pub async fn reconcile(&self, record: &RawRecord) -> ReconcileOutcome {
        reconcile(self.adapter, self.store, record).await
    }

    pub async fn fetch(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<RawRecord>> {
        let records = self
            .source
            .fetch_records(self.adapter.target(), from, to)
            .await
            .with_context(|| format!("fetching {}", self.adapter.target()))?;
        info!(dataset = self.adapter.key(), records = records.len(), "fetched records");
        Ok(records)
    }

    /// Schema, then fetch, then every record in source order. Only schema and fetch errors escape.
    pub async fn process_date_range(&self, from: NaiveDate, to: NaiveDate) -> Result<DatasetRunSummary> {
        let created_tables = self.ensure_schema().await?;
        let records = self.fetch(from, to).await?;
        Ok(self.reconcile_batch(created_tables, &records, from, to).await)
    }

    /// Reconciles an already fetched batch. Per-record failures land in the summary.
    pub async fn reconcile_batch(
        &self,
        created_tables: Vec<String>,
        records: &[RawRecord],
        from: NaiveDate,
        to: NaiveDate,
    ) -> DatasetRunSummary {
        let span = info_span!("dataset_sync", dataset = self.adapter.key(), %from, %to);
        async move {
            let mut summary = DatasetRunSummary::new(self.adapter, from, to);
            summary.created_tables = created_tables;
            summary.fetched = records.len();

            for record in records {
                let outcome = self.reconcile(record).await;
                summary.record(&outcome);
            }

            summary.finished_at = Utc::now();
            info!(
                inserted = summary.inserted,
                updated = summary.updated,
                skipped = summary.skipped,
                failed = summary.failed,
                "dataset synced"
            );
            summary
        }
        .instrument(span)
        .await
    }
}
