//! Entity-per-submission datasets: a main table keyed by record id plus multiselect child tables.

use std::collections::HashSet;

use async_trait::async_trait;
use liws_core::{FieldValue, MultiselectField, Params, RawRecord, SqlType, SurveySchema};
use liws_storage::Store;
use tracing::{debug, info};

use crate::{existing_tables, AdapterError, DatasetAdapter, RecordKey, SourceTarget, WriteMode};

#[derive(Debug, Clone)]
struct ChildStatements {
    field: MultiselectField,
    create: String,
    select: String,
    delete: String,
    insert: String,
}

/// Survey dataset with its SQL rendered once from the descriptor.
#[derive(Debug, Clone)]
pub struct SurveyDataset {
    key: String,
    display_name: String,
    target: SourceTarget,
    schema: SurveySchema,
    create_main: String,
    insert_main: String,
    update_main: String,
    exists: String,
    children: Vec<ChildStatements>,
}

impl SurveyDataset {
    pub fn new(
        key: impl Into<String>,
        display_name: impl Into<String>,
        target: SourceTarget,
        schema: SurveySchema,
    ) -> Result<Self, AdapterError> {
        schema.validate()?;
        let id = schema.id_column().column;
        let table = schema.main_table;

        let mut definitions: Vec<String> = schema.columns.iter().map(|c| c.ddl()).collect();
        definitions.push(format!("PRIMARY KEY ({id})"));
        let create_main = format!(
            "CREATE TABLE {table} (\n    {}\n)",
            definitions.join(",\n    ")
        );

        let names: Vec<&str> = schema.columns.iter().map(|c| c.column).collect();
        let insert_main = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            names.join(", "),
            names
                .iter()
                .map(|n| format!(":{n}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let update_main = format!(
            "UPDATE {table} SET {} WHERE {id} = :{id}",
            names
                .iter()
                .filter(|n| **n != id)
                .map(|n| format!("{n} = :{n}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let exists = format!("SELECT {id} FROM {table} WHERE {id} = :{id}");

        let children = schema
            .multiselect
            .iter()
            .map(|field| {
                let (child, column) = (field.table, field.column);
                ChildStatements {
                    field: *field,
                    create: format!(
                        "CREATE TABLE {child} (\n    {id} BIGINT NOT NULL,\n    {column} TEXT NOT NULL\n)"
                    ),
                    select: format!("SELECT {column} FROM {child} WHERE {id} = :{id}"),
                    delete: format!("DELETE FROM {child} WHERE {id} = :{id}"),
                    insert: format!("INSERT INTO {child} ({id}, {column}) VALUES (:{id}, :{column})"),
                }
            })
            .collect();

        Ok(Self {
            key: key.into(),
            display_name: display_name.into(),
            target,
            schema,
            create_main,
            insert_main,
            update_main,
            exists,
            children,
        })
    }

    pub fn schema(&self) -> &SurveySchema {
        &self.schema
    }

    pub fn create_main_sql(&self) -> &str {
        &self.create_main
    }

    pub fn insert_main_sql(&self) -> &str {
        &self.insert_main
    }

    pub fn update_main_sql(&self) -> &str {
        &self.update_main
    }

    fn id_params(&self, id: i64) -> Params {
        Params::new().with(
            self.schema.id_column().column,
            SqlType::BigInt,
            FieldValue::Integer(id),
        )
    }

    fn require_id(&self, record: &RawRecord) -> Result<i64, AdapterError> {
        record
            .id()
            .ok_or_else(|| AdapterError::Message("record has no integer _id".to_string()))
    }

    async fn insert_children(
        &self,
        store: &dyn Store,
        child: &ChildStatements,
        id: i64,
        values: &[String],
    ) -> Result<(), AdapterError> {
        for value in values {
            let params = self.id_params(id).with(
                child.field.column,
                SqlType::Text,
                FieldValue::Text(value.clone()),
            );
            store.execute(&child.insert, &params).await?;
        }
        Ok(())
    }
}

fn casefold_set<'a>(values: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    values.into_iter().map(|v| v.to_lowercase()).collect()
}

#[async_trait]
impl DatasetAdapter for SurveyDataset {
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
        WriteMode::CheckThenWrite
    }

    fn record_key(&self, record: &RawRecord) -> Result<RecordKey, String> {
        record
            .id()
            .map(RecordKey::Id)
            .ok_or_else(|| "missing identifier".to_string())
    }

    async fn ensure_schema(&self, store: &dyn Store) -> Result<Vec<String>, AdapterError> {
        let existing = existing_tables(store, &format!("{}%", self.schema.table_prefix)).await?;
        let mut created = Vec::new();

        if !existing.contains(&self.schema.main_table.to_lowercase()) {
            store.execute(&self.create_main, &Params::new()).await?;
            info!(dataset = %self.key, table = self.schema.main_table, "created table");
            created.push(self.schema.main_table.to_string());
        }
        for child in &self.children {
            if existing.contains(&child.field.table.to_lowercase()) {
                continue;
            }
            store.execute(&child.create, &Params::new()).await?;
            info!(dataset = %self.key, table = child.field.table, "created table");
            created.push(child.field.table.to_string());
        }
        Ok(created)
    }

    async fn record_exists(&self, store: &dyn Store, key: &RecordKey) -> Result<bool, AdapterError> {
        let RecordKey::Id(id) = key else {
            return Err(AdapterError::Message(format!(
                "survey dataset {} is keyed by record id, got {key}",
                self.key
            )));
        };
        let rows = store.query(&self.exists, &self.id_params(*id)).await?;
        Ok(!rows.is_empty())
    }

    async fn insert_record(&self, store: &dyn Store, record: &RawRecord) -> Result<(), AdapterError> {
        let id = self.require_id(record)?;
        store
            .execute(&self.insert_main, &self.schema.main_params(record))
            .await?;
        for child in &self.children {
            let values = self.schema.multiselect_values(&child.field, record);
            self.insert_children(store, child, id, &values).await?;
        }
        Ok(())
    }

    async fn update_record(&self, store: &dyn Store, record: &RawRecord) -> Result<(), AdapterError> {
        let id = self.require_id(record)?;
        store
            .execute(&self.update_main, &self.schema.main_params(record))
            .await?;

        for child in &self.children {
            let stored: Vec<String> = store
                .query(&child.select, &self.id_params(id))
                .await?
                .into_iter()
                .filter_map(|row| row.into_iter().next())
                .filter_map(|value| value.as_text().map(str::to_string))
                .collect();
            let incoming = self.schema.multiselect_values(&child.field, record);

            // Incoming values are distinct, so a longer stored list means duplicate rows.
            if stored.len() == incoming.len()
                && casefold_set(stored.iter().map(String::as_str))
                    == casefold_set(incoming.iter().map(String::as_str))
            {
                continue;
            }

            store.execute(&child.delete, &self.id_params(id)).await?;
            self.insert_children(store, child, id, &incoming).await?;
            debug!(
                dataset = %self.key,
                record_id = id,
                table = child.field.table,
                before = stored.len(),
                after = incoming.len(),
                "replaced multiselect values"
            );
        }
        Ok(())
    }
}
