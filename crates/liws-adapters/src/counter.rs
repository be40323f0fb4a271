//! Time-bucketed counter datasets keyed by (timestamp, location).

use async_trait::async_trait;
use liws_core::{clean_string, date_or_null, CounterSchema, FieldValue, Params, RawRecord, SqlType};
use liws_storage::Store;
use tracing::info;

use crate::{existing_tables, AdapterError, DatasetAdapter, RecordKey, SourceTarget, WriteMode};

#[derive(Debug, Clone)]
pub struct CounterDataset {
    key: String,
    display_name: String,
    target: SourceTarget,
    schema: CounterSchema,
    create: String,
    insert: String,
    update: String,
    exists: String,
}

impl CounterDataset {
    pub fn new(
        key: impl Into<String>,
        display_name: impl Into<String>,
        target: SourceTarget,
        schema: CounterSchema,
    ) -> Result<Self, AdapterError> {
        schema.validate()?;
        let table = schema.table;
        let ts = schema.timestamp.column;
        let loc = schema.location.column;
        let measure = schema.measure.column;

        let create = format!(
            "CREATE TABLE {table} (\n    {},\n    {},\n    {},\n    PRIMARY KEY ({ts}, {loc})\n)",
            schema.timestamp.ddl(),
            schema.location.ddl(),
            schema.measure.ddl()
        );
        let insert = format!(
            "INSERT INTO {table} ({ts}, {loc}, {measure}) VALUES (:{ts}, :{loc}, :{measure})"
        );
        let update =
            format!("UPDATE {table} SET {measure} = :{measure} WHERE {ts} = :{ts} AND {loc} = :{loc}");
        let exists = format!("SELECT {ts} FROM {table} WHERE {ts} = :{ts} AND {loc} = :{loc}");

        Ok(Self {
            key: key.into(),
            display_name: display_name.into(),
            target,
            schema,
            create,
            insert,
            update,
            exists,
        })
    }

    pub fn schema(&self) -> &CounterSchema {
        &self.schema
    }

    pub fn create_sql(&self) -> &str {
        &self.create
    }

    pub fn update_sql(&self) -> &str {
        &self.update
    }

    fn key_params(&self, key: &RecordKey) -> Result<Params, AdapterError> {
        match key {
            RecordKey::Composite {
                timestamp,
                location,
            } => Ok(Params::new()
                .with(
                    self.schema.timestamp.column,
                    SqlType::Timestamp,
                    FieldValue::Timestamp(*timestamp),
                )
                .with(
                    self.schema.location.column,
                    SqlType::Text,
                    FieldValue::Text(location.clone()),
                )),
            RecordKey::Id(_) => Err(AdapterError::Message(format!(
                "counter dataset {} is keyed by (timestamp, location), got {key}",
                self.key
            ))),
        }
    }
}

#[async_trait]
impl DatasetAdapter for CounterDataset {
    fn key(&self) -> &str {
        &self.key
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn target(&self) -> &SourceTarget {
        &self.target
    }

    fn write_mode(&self) -> WriteMode {
        WriteMode::InsertOrUpdate
    }

    fn record_key(&self, record: &RawRecord) -> Result<RecordKey, String> {
        let timestamp = date_or_null(record.field(self.schema.timestamp.source))
            .ok_or_else(|| format!("missing or unparseable {}", self.schema.timestamp.source))?;
        let location = clean_string(record.field(self.schema.location.source))
            .ok_or_else(|| format!("missing {}", self.schema.location.source))?;
        Ok(RecordKey::Composite {
            timestamp,
            location,
        })
    }

    async fn ensure_schema(&self, store: &dyn Store) -> Result<Vec<String>, AdapterError> {
        let existing = existing_tables(store, self.schema.table).await?;
        if existing.contains(&self.schema.table.to_lowercase()) {
            return Ok(Vec::new());
        }
        store.execute(&self.create, &Params::new()).await?;
        info!(dataset = %self.key, table = self.schema.table, "created table");
        Ok(vec![self.schema.table.to_string()])
    }

    async fn record_exists(&self, store: &dyn Store, key: &RecordKey) -> Result<bool, AdapterError> {
        let rows = store.query(&self.exists, &self.key_params(key)?).await?;
        Ok(!rows.is_empty())
    }

    async fn insert_record(&self, store: &dyn Store, record: &RawRecord) -> Result<(), AdapterError> {
        store.execute(&self.insert, &self.schema.params(record)).await?;
        Ok(())
    }

    async fn update_record(&self, store: &dyn Store, record: &RawRecord) -> Result<(), AdapterError> {
        store.execute(&self.update, &self.schema.params(record)).await?;
        Ok(())
    }
}
