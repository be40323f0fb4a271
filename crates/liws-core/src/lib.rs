//! Raw record model, typed relational values and field mapping rules for LIWS.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub mod schema;

pub use schema::{
    ColumnSpec, CounterSchema, DescriptorError, MultiselectField, SurveySchema, ValueKind,
};

pub const CRATE_NAME: &str = "liws-core";

/// Source field carrying the record identifier.
pub const ID_FIELD: &str = "_id";
pub const START_DATE_FIELD: &str = "_start_date";
pub const ENTERED_BY_FIELD: &str = "_entered_by";

/// UTF-8 right single quotation mark read back through a Mac Roman decoder.
const MISDECODED_APOSTROPHE: &str = "'Äô";
const RIGHT_SINGLE_QUOTE: &str = "\u{2019}";

static JSON_NULL: JsonValue = JsonValue::Null;

/// One submission as returned by the reporting API, untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(Map<String, JsonValue>);

impl RawRecord {
    pub fn new(fields: Map<String, JsonValue>) -> Self {
        Self(fields)
    }

    /// Wraps a JSON object; any other shape is not a record.
    pub fn from_value(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    /// Field lookup where an absent key reads as JSON null.
    pub fn field(&self, name: &str) -> &JsonValue {
        self.0.get(name).unwrap_or(&JSON_NULL)
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    /// Integer identifier from `_id`, if the record carries one.
    pub fn id(&self) -> Option<i64> {
        match number_or_null(self.field(ID_FIELD)) {
            Some(Number::Integer(id)) => Some(id),
            _ => None,
        }
    }
}

impl From<Map<String, JsonValue>> for RawRecord {
    fn from(fields: Map<String, JsonValue>) -> Self {
        Self(fields)
    }
}

/// Numeric input that keeps the integer/float distinction of the source JSON.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Number {
    Integer(i64),
    Float(f64),
}

/// Column type as declared in generated DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    BigInt,
    Numeric,
    Text,
    Timestamp,
}

impl SqlType {
    pub fn ddl(self) -> &'static str {
        match self {
            SqlType::BigInt => "BIGINT",
            SqlType::Numeric => "NUMERIC",
            SqlType::Text => "TEXT",
            SqlType::Timestamp => "TIMESTAMP",
        }
    }
}

/// Typed relational value produced by the field mapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Timestamp(NaiveDateTime),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        value.map(FieldValue::Text).unwrap_or(FieldValue::Null)
    }
}

impl From<Option<Number>> for FieldValue {
    fn from(value: Option<Number>) -> Self {
        match value {
            Some(Number::Integer(n)) => FieldValue::Integer(n),
            Some(Number::Float(n)) => FieldValue::Float(n),
            None => FieldValue::Null,
        }
    }
}

impl From<Option<NaiveDateTime>> for FieldValue {
    fn from(value: Option<NaiveDateTime>) -> Self {
        value.map(FieldValue::Timestamp).unwrap_or(FieldValue::Null)
    }
}

/// Statement parameter bound by name; `sql_type` types the value when it is null.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedParam {
    pub name: String,
    pub sql_type: SqlType,
    pub value: FieldValue,
}

/// Ordered set of named statement parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Vec<NamedParam>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, sql_type: SqlType, value: FieldValue) -> Self {
        self.push(name, sql_type, value);
        self
    }

    /// Adds or replaces the parameter called `name`.
    pub fn push(&mut self, name: &str, sql_type: SqlType, value: FieldValue) {
        let param = NamedParam {
            name: name.to_string(),
            sql_type,
            value,
        };
        match self.0.iter_mut().find(|p| p.name.eq_ignore_ascii_case(name)) {
            Some(existing) => *existing = param,
            None => self.0.push(param),
        }
    }

    pub fn get(&self, name: &str) -> Option<&NamedParam> {
        self.0.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedParam> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn stringify(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(_) | JsonValue::Object(_) => Some(value.to_string()),
    }
}

fn normalize_apostrophes(mut text: String) -> String {
    // Replacing can splice a new artifact together, so run to a fixed point.
    while text.contains(MISDECODED_APOSTROPHE) || text.contains(RIGHT_SINGLE_QUOTE) {
        text = text
            .replace(MISDECODED_APOSTROPHE, "'")
            .replace(RIGHT_SINGLE_QUOTE, "'");
    }
    text
}

/// Stringifies, trims and normalizes apostrophes. Blank input yields `None`.
pub fn clean_string(value: &JsonValue) -> Option<String> {
    let text = stringify(value)?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(normalize_apostrophes(trimmed.to_string()))
}

/// Numbers pass through unchanged; numeric strings parse as integers; anything else is `None`.
pub fn number_or_null(value: &JsonValue) -> Option<Number> {
    match value {
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Number::Integer(i))
            } else {
                n.as_f64().map(Number::Float)
            }
        }
        JsonValue::String(s) => s.trim().parse::<i64>().ok().map(Number::Integer),
        _ => None,
    }
}

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// Best-effort timestamp parse. Unparseable input is `None`, never an error.
pub fn date_or_null(value: &JsonValue) -> Option<NaiveDateTime> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&text) {
        return Some(parsed.naive_local());
    }
    for format in DATE_TIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(&text, format) {
            return Some(parsed);
        }
    }
    DATE_FORMATS.iter().find_map(|format| {
        NaiveDate::parse_from_str(&text, format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
    })
}

/// Radio buttons and drop-downs arrive as `""` when unset or as `[value]` when set.
pub fn array_single_element(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Array(items) => items.first().and_then(clean_string),
        _ => None,
    }
}

/// Cleaned, non-blank elements of a JSON array in source order.
pub fn json_array_to_strings(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::Array(items) => items.iter().filter_map(clean_string).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_string_nulls_blank_input() {
        assert_eq!(clean_string(&json!("")), None);
        assert_eq!(clean_string(&json!("   \t\n")), None);
        assert_eq!(clean_string(&JsonValue::Null), None);
    }

    #[test]
    fn clean_string_trims_and_fixes_apostrophes() {
        assert_eq!(
            clean_string(&json!("  Pitt'Äôs library ")),
            Some("Pitt's library".to_string())
        );
        assert_eq!(
            clean_string(&json!("Hillman\u{2019}s")),
            Some("Hillman's".to_string())
        );
        assert_eq!(clean_string(&json!(12)), Some("12".to_string()));
    }

    #[test]
    fn clean_string_is_idempotent() {
        for input in ["  a  ", "x'Äô'Äôy", "plain", "it\u{2019}s ", "'ÄÄôô"] {
            let once = clean_string(&json!(input));
            let twice = once.clone().and_then(|s| clean_string(&json!(s)));
            assert_eq!(once, twice, "input {input:?}");
        }
    }

    #[test]
    fn number_or_null_preserves_kind() {
        assert_eq!(number_or_null(&json!(7)), Some(Number::Integer(7)));
        assert_eq!(number_or_null(&json!(7.5)), Some(Number::Float(7.5)));
        assert_eq!(number_or_null(&json!("")), None);
        assert_eq!(number_or_null(&json!("12")), Some(Number::Integer(12)));
        assert_eq!(number_or_null(&json!("12.5")), None);
        assert_eq!(number_or_null(&json!(["12"])), None);
        assert_eq!(number_or_null(&json!({"n": 1})), None);
    }

    #[test]
    fn date_or_null_accepts_common_shapes_and_swallows_garbage() {
        let midnight = NaiveDate::from_ymd_opt(2023, 9, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap();
        assert_eq!(date_or_null(&json!("2023-09-01")), Some(midnight));
        assert_eq!(date_or_null(&json!("09/01/2023")), Some(midnight));

        let afternoon = NaiveDate::from_ymd_opt(2023, 9, 1)
            .and_then(|d| d.and_hms_opt(14, 30, 0))
            .unwrap();
        assert_eq!(date_or_null(&json!("2023-09-01 14:30:00")), Some(afternoon));
        assert_eq!(date_or_null(&json!("09/01/2023 2:30 PM")), Some(afternoon));
        assert_eq!(date_or_null(&json!("2023-09-01T14:30:00-04:00")), Some(afternoon));

        assert_eq!(date_or_null(&json!("not a date")), None);
        assert_eq!(date_or_null(&json!("")), None);
        assert_eq!(date_or_null(&json!([])), None);
    }

    #[test]
    fn array_single_element_cases() {
        assert_eq!(array_single_element(&json!([])), None);
        assert_eq!(array_single_element(&json!(["Remote"])), Some("Remote".to_string()));
        assert_eq!(array_single_element(&json!("Remote")), None);
        assert_eq!(array_single_element(&json!([null])), None);
        assert_eq!(array_single_element(&json!(["  "])), None);
        assert_eq!(array_single_element(&json!(["A", "B"])), Some("A".to_string()));
    }

    #[test]
    fn json_array_to_strings_drops_blanks_in_order() {
        assert_eq!(json_array_to_strings(&json!(["A", " ", "B"])), vec!["A", "B"]);
        assert_eq!(json_array_to_strings(&json!([null, "C"])), vec!["C"]);
        assert!(json_array_to_strings(&json!("A")).is_empty());
        assert!(json_array_to_strings(&JsonValue::Null).is_empty());
    }

    #[test]
    fn raw_record_id_requires_integer() {
        let rec = RawRecord::from_value(json!({"_id": 42})).unwrap();
        assert_eq!(rec.id(), Some(42));
        let rec = RawRecord::from_value(json!({"_id": "43"})).unwrap();
        assert_eq!(rec.id(), Some(43));
        let rec = RawRecord::from_value(json!({"_id": 4.5})).unwrap();
        assert_eq!(rec.id(), None);
        let rec = RawRecord::from_value(json!({"Audience": ["Staff"]})).unwrap();
        assert_eq!(rec.id(), None);
        assert!(rec.field("missing").is_null());
        assert!(RawRecord::from_value(json!([1, 2])).is_none());
    }

    #[test]
    fn params_replace_by_name() {
        let params = Params::new()
            .with("RecordId", SqlType::BigInt, FieldValue::Integer(1))
            .with("recordid", SqlType::BigInt, FieldValue::Integer(2));
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("RECORDID").unwrap().value, FieldValue::Integer(2));
    }
}
