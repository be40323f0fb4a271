#![allow(dead_code)]

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use liws_adapters::{
    builtin_dataset, DatasetAdapter, RecordSource, SourceError, SourceTarget, TargetOverrides,
};
use liws_core::{FieldValue, Params, RawRecord, SqlType};
use liws_storage::{Dialect, Row, SqliteStore, Store, StoreError};
use serde_json::Value;

pub fn record(value: Value) -> RawRecord {
    RawRecord::from_value(value).expect("object record")
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn instruction_outreach() -> Box<dyn DatasetAdapter> {
    builtin_dataset("instruction-outreach")
        .unwrap()
        .adapter(&TargetOverrides::default())
        .unwrap()
}

pub fn hill_head_counts() -> Box<dyn DatasetAdapter> {
    builtin_dataset("hill-head-counts")
        .unwrap()
        .adapter(&TargetOverrides::default())
        .unwrap()
}

pub fn gate_counts() -> Box<dyn DatasetAdapter> {
    builtin_dataset("gate-counts")
        .unwrap()
        .adapter(&TargetOverrides {
            dataset_id: Some(9),
            ..Default::default()
        })
        .unwrap()
}

/// Wraps an in-memory SQLite store and remembers every executed statement.
pub struct RecordingStore {
    inner: SqliteStore,
    executed: Mutex<Vec<String>>,
}

impl RecordingStore {
    pub async fn new() -> Self {
        Self {
            inner: SqliteStore::in_memory().await.unwrap(),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.executed.lock().unwrap().clear();
    }
}

#[async_trait]
impl Store for RecordingStore {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    async fn query(&self, sql: &str, params: &Params) -> Result<Vec<Row>, StoreError> {
        self.inner.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &Params) -> Result<u64, StoreError> {
        self.executed.lock().unwrap().push(sql.to_string());
        self.inner.execute(sql, params).await
    }

    async fn table_names(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.inner.table_names(pattern).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Serves canned records, or fails every fetch when built with `failing`.
pub struct FixtureSource {
    records: Vec<RawRecord>,
    fail: bool,
    fail_gate_counts: bool,
    requests: Mutex<Vec<(SourceTarget, NaiveDate, NaiveDate)>>,
}

impl FixtureSource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            fail: false,
            fail_gate_counts: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    /// Serves `records` for custom datasets and rejects every gate-count request.
    pub fn failing_for_gate_counts(records: Vec<RawRecord>) -> Self {
        Self {
            fail_gate_counts: true,
            ..Self::new(records)
        }
    }

    pub fn requests(&self) -> Vec<(SourceTarget, NaiveDate, NaiveDate)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSource for FixtureSource {
    async fn fetch_records(
        &self,
        target: &SourceTarget,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<RawRecord>, SourceError> {
        self.requests
            .lock()
            .unwrap()
            .push((target.clone(), from, to));
        if self.fail {
            return Err(SourceError::Api("{\"type\":\"error\"}".to_string()));
        }
        if self.fail_gate_counts && matches!(target, SourceTarget::GateCount { .. }) {
            return Err(SourceError::NotAuthorized);
        }
        Ok(self.records.clone())
    }
}

pub fn id_params(id: i64) -> Params {
    Params::new().with("record_id", SqlType::BigInt, FieldValue::Integer(id))
}

/// Sorted text values of one child column for a record.
pub async fn child_values(store: &dyn Store, table: &str, column: &str, id: i64) -> Vec<String> {
    let rows = store
        .query(
            &format!("SELECT {column} FROM {table} WHERE record_id = :record_id ORDER BY {column}"),
            &id_params(id),
        )
        .await
        .unwrap();
    rows.into_iter()
        .map(|row| row[0].as_text().unwrap().to_string())
        .collect()
}

pub async fn count(store: &dyn Store, table: &str) -> i64 {
    let rows = store
        .query(&format!("SELECT COUNT(*) FROM {table}"), &Params::new())
        .await
        .unwrap();
    rows[0][0].as_i64().unwrap()
}
