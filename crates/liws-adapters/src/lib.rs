//! Dataset adapter contracts, the built-in LibInsight datasets and the record source.

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use liws_core::{DescriptorError, RawRecord};
use liws_storage::{Store, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod catalog;
pub mod counter;
pub mod source;
pub mod survey;

pub use catalog::{
    adapter_for_dataset, builtin_dataset, builtin_datasets, BuiltinDataset, DatasetShape,
    TargetOverrides,
};
pub use counter::CounterDataset;
pub use source::{LibInsightClient, RecordSource, SourceError};
pub use survey::SurveyDataset;

pub const CRATE_NAME: &str = "liws-adapters";

/// Where a dataset's records come from on the LibInsight side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTarget {
    /// Custom dataset exposed through a "Widgets and APIs" request.
    CustomDataset { dataset_id: u32, request_id: u32 },
    /// Gate-count overview, aggregated at the given granularity.
    GateCount { dataset_id: u32, aggregate: String },
}

impl fmt::Display for SourceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceTarget::CustomDataset {
                dataset_id,
                request_id,
            } => write!(f, "custom-dataset {dataset_id} (request {request_id})"),
            SourceTarget::GateCount {
                dataset_id,
                aggregate,
            } => write!(f, "gate-count {dataset_id} ({aggregate})"),
        }
    }
}

/// How the engine turns one record into writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Existence check by key, then insert or update.
    CheckThenWrite,
    /// Insert first; a uniqueness violation on the key falls back to update.
    InsertOrUpdate,
}

/// Identity of a record within its dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey {
    Id(i64),
    Composite {
        timestamp: NaiveDateTime,
        location: String,
    },
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Id(id) => write!(f, "{id}"),
            RecordKey::Composite {
                timestamp,
                location,
            } => write!(f, "{timestamp}@{location}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdapterError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, AdapterError::Store(err) if err.is_unique_violation())
    }
}

/// A dataset bound to its warehouse schema and its source identity.
#[async_trait]
pub trait DatasetAdapter: Send + Sync {
    fn key(&self) -> &str;
    fn display_name(&self) -> &str;
    fn target(&self) -> &SourceTarget;
    fn write_mode(&self) -> WriteMode;

    /// Extracts the record's key, or the reason it has none.
    fn record_key(&self, record: &RawRecord) -> Result<RecordKey, String>;

    /// Creates missing tables; returns the names it created.
    async fn ensure_schema(&self, store: &dyn Store) -> Result<Vec<String>, AdapterError>;

    async fn record_exists(&self, store: &dyn Store, key: &RecordKey) -> Result<bool, AdapterError>;

    async fn insert_record(&self, store: &dyn Store, record: &RawRecord) -> Result<(), AdapterError>;

    async fn update_record(&self, store: &dyn Store, record: &RawRecord) -> Result<(), AdapterError>;
}

/// Lowercased catalog names for a LIKE pattern.
pub(crate) async fn existing_tables(
    store: &dyn Store,
    pattern: &str,
) -> Result<std::collections::HashSet<String>, StoreError> {
    Ok(store
        .table_names(pattern)
        .await?
        .into_iter()
        .map(|name| name.to_lowercase())
        .collect())
}
