//! Static descriptors for the warehouse tables a dataset maps onto.

use std::collections::HashSet;

use thiserror::Error;

use crate::{
    array_single_element, clean_string, date_or_null, json_array_to_strings, number_or_null,
    FieldValue, Params, RawRecord, SqlType, ENTERED_BY_FIELD, ID_FIELD, START_DATE_FIELD,
};

/// How a source field is read and stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Integer primary key.
    Identifier,
    Text,
    Number,
    Date,
    SingleSelect,
}

impl ValueKind {
    pub fn sql_type(self) -> SqlType {
        match self {
            ValueKind::Identifier => SqlType::BigInt,
            ValueKind::Number => SqlType::Numeric,
            ValueKind::Date => SqlType::Timestamp,
            ValueKind::Text | ValueKind::SingleSelect => SqlType::Text,
        }
    }

    pub fn map(self, value: &serde_json::Value) -> FieldValue {
        match self {
            ValueKind::Identifier => match number_or_null(value) {
                Some(crate::Number::Integer(id)) => FieldValue::Integer(id),
                _ => FieldValue::Null,
            },
            ValueKind::Text => clean_string(value).into(),
            ValueKind::Number => number_or_null(value).into(),
            ValueKind::Date => date_or_null(value).into(),
            ValueKind::SingleSelect => array_single_element(value).into(),
        }
    }
}

/// One main-table column and the source field feeding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub column: &'static str,
    pub source: &'static str,
    pub kind: ValueKind,
    pub required: bool,
}

impl ColumnSpec {
    pub const fn new(column: &'static str, source: &'static str, kind: ValueKind) -> Self {
        Self {
            column,
            source,
            kind,
            required: false,
        }
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn ddl(&self) -> String {
        let nullability = if self.required { "NOT NULL" } else { "NULL" };
        format!("{} {} {}", self.column, self.kind.sql_type().ddl(), nullability)
    }
}

/// A multi-valued source field stored one row per selected value in its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiselectField {
    pub source: &'static str,
    pub table: &'static str,
    pub column: &'static str,
}

pub const RECORD_ID_COLUMN: ColumnSpec =
    ColumnSpec::new("record_id", ID_FIELD, ValueKind::Identifier).required();

/// The three columns every survey submission carries.
pub const SUBMISSION_COLUMNS: [ColumnSpec; 3] = [
    RECORD_ID_COLUMN,
    ColumnSpec::new("start_date", START_DATE_FIELD, ValueKind::Date).required(),
    ColumnSpec::new("entered_by", ENTERED_BY_FIELD, ValueKind::Text).required(),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("`{0}` is not a valid SQL identifier")]
    InvalidIdentifier(String),
    #[error("table {table} must have exactly one identifier column, found {found}")]
    IdentifierColumnCount { table: String, found: usize },
    #[error("column `{column}` declared twice in {table}")]
    DuplicateColumn { table: String, column: String },
    #[error("source field `{0}` is mapped more than once")]
    DuplicateSourceField(String),
    #[error("table `{0}` declared more than once")]
    DuplicateTable(String),
    #[error("child table {table} reuses key column `{column}` as its value column")]
    ChildColumnIsKey { table: String, column: String },
    #[error("table {table} does not start with the schema prefix `{prefix}`")]
    TableOutsidePrefix { table: String, prefix: String },
}

/// Lowercase snake_case only: names are spliced into SQL text and must survive case folding.
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn check_identifier(name: &str) -> Result<(), DescriptorError> {
    if is_sql_identifier(name) {
        Ok(())
    } else {
        Err(DescriptorError::InvalidIdentifier(name.to_string()))
    }
}

/// Entity-per-submission layout: one main table plus a child table per multiselect field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurveySchema {
    pub main_table: &'static str,
    /// Shared name prefix of every table, used for catalog lookups.
    pub table_prefix: &'static str,
    pub columns: &'static [ColumnSpec],
    pub multiselect: &'static [MultiselectField],
}

impl SurveySchema {
    pub fn validate(&self) -> Result<(), DescriptorError> {
        check_identifier(self.main_table)?;
        self.check_prefix(self.main_table)?;

        let identifiers = self
            .columns
            .iter()
            .filter(|c| c.kind == ValueKind::Identifier)
            .count();
        if identifiers != 1 {
            return Err(DescriptorError::IdentifierColumnCount {
                table: self.main_table.to_string(),
                found: identifiers,
            });
        }

        let mut columns = HashSet::new();
        let mut sources = HashSet::new();
        for column in self.columns {
            check_identifier(column.column)?;
            if !columns.insert(column.column) {
                return Err(DescriptorError::DuplicateColumn {
                    table: self.main_table.to_string(),
                    column: column.column.to_string(),
                });
            }
            if !sources.insert(column.source) {
                return Err(DescriptorError::DuplicateSourceField(column.source.to_string()));
            }
        }

        let key = self.id_column().column;
        let mut tables = HashSet::from([self.main_table]);
        for field in self.multiselect {
            check_identifier(field.table)?;
            self.check_prefix(field.table)?;
            check_identifier(field.column)?;
            if !sources.insert(field.source) {
                return Err(DescriptorError::DuplicateSourceField(field.source.to_string()));
            }
            if !tables.insert(field.table) {
                return Err(DescriptorError::DuplicateTable(field.table.to_string()));
            }
            if field.column == key {
                return Err(DescriptorError::ChildColumnIsKey {
                    table: field.table.to_string(),
                    column: field.column.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Catalog lookups only see tables under the prefix.
    fn check_prefix(&self, table: &str) -> Result<(), DescriptorError> {
        if table.starts_with(self.table_prefix) {
            Ok(())
        } else {
            Err(DescriptorError::TableOutsidePrefix {
                table: table.to_string(),
                prefix: self.table_prefix.to_string(),
            })
        }
    }

    /// The identifier column. Only meaningful on a validated schema.
    pub fn id_column(&self) -> &ColumnSpec {
        self.columns
            .iter()
            .find(|c| c.kind == ValueKind::Identifier)
            .unwrap_or(&RECORD_ID_COLUMN)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.main_table).chain(self.multiselect.iter().map(|f| f.table))
    }

    /// Main-table parameter set, one named parameter per column.
    pub fn main_params(&self, record: &RawRecord) -> Params {
        let mut params = Params::new();
        for column in self.columns {
            params.push(
                column.column,
                column.kind.sql_type(),
                column.kind.map(record.field(column.source)),
            );
        }
        params
    }

    /// Values for one multiselect field, de-duplicated case-insensitively in source order.
    pub fn multiselect_values(&self, field: &MultiselectField, record: &RawRecord) -> Vec<String> {
        let mut seen = HashSet::new();
        json_array_to_strings(record.field(field.source))
            .into_iter()
            .filter(|value| seen.insert(value.to_lowercase()))
            .collect()
    }
}

/// Time-bucketed aggregate keyed by (timestamp, location).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSchema {
    pub table: &'static str,
    pub timestamp: ColumnSpec,
    pub location: ColumnSpec,
    pub measure: ColumnSpec,
}

impl CounterSchema {
    pub fn validate(&self) -> Result<(), DescriptorError> {
        check_identifier(self.table)?;
        let mut columns = HashSet::new();
        let mut sources = HashSet::new();
        for column in self.columns() {
            check_identifier(column.column)?;
            if !columns.insert(column.column) {
                return Err(DescriptorError::DuplicateColumn {
                    table: self.table.to_string(),
                    column: column.column.to_string(),
                });
            }
            if !sources.insert(column.source) {
                return Err(DescriptorError::DuplicateSourceField(column.source.to_string()));
            }
        }
        Ok(())
    }

    pub fn columns(&self) -> [&ColumnSpec; 3] {
        [&self.timestamp, &self.location, &self.measure]
    }

    pub fn params(&self, record: &RawRecord) -> Params {
        let mut params = Params::new();
        for column in self.columns() {
            params.push(
                column.column,
                column.kind.sql_type(),
                column.kind.map(record.field(column.source)),
            );
        }
        params
    }
}
