//! Built-in LibInsight datasets.
//!
//! `_id`, `_start_date` and `_entered_by` are always present and map to non-null columns.
//! Free-text inputs, drop-downs and radio buttons map to nullable text, numeric inputs to
//! nullable numbers. Multiselect fields get their own table of (record id, value) rows.

use liws_core::schema::SUBMISSION_COLUMNS;
use liws_core::{ColumnSpec, CounterSchema, MultiselectField, SurveySchema, ValueKind};

use crate::{AdapterError, CounterDataset, DatasetAdapter, SourceTarget, SurveyDataset};

const INSTRUCTION_OUTREACH_COLUMNS: &[ColumnSpec] = &[
    SUBMISSION_COLUMNS[0],
    SUBMISSION_COLUMNS[1],
    SUBMISSION_COLUMNS[2],
    ColumnSpec::new(
        "event_name",
        "Event Name (if a class, search for course title and number  here) ",
        ValueKind::Text,
    ),
    ColumnSpec::new("faculty_sponsor_name", "Faculty/ Sponsor Name", ValueKind::Text),
    ColumnSpec::new("faculty_sponsor_email", "Faculty/ Sponsor Email", ValueKind::Text),
    ColumnSpec::new("department", "Department", ValueKind::SingleSelect),
    ColumnSpec::new("number_of_participants", "Number of Participants", ValueKind::Number),
    ColumnSpec::new("duration_of_event", "Duration of Event", ValueKind::Number),
    ColumnSpec::new(
        "co_instructors_organisation",
        "Co-Instructor(s)/ Organisation",
        ValueKind::Text,
    ),
    ColumnSpec::new("notes", "Notes", ValueKind::Text),
    ColumnSpec::new("location_of_event", "Location of Event", ValueKind::SingleSelect),
    ColumnSpec::new("location_other", "Location - Other", ValueKind::Text),
    ColumnSpec::new("event_type", "Event Type", ValueKind::SingleSelect),
    ColumnSpec::new(
        "class_number",
        "Class Number (5 digits) Available at  Class Search",
        ValueKind::Number,
    ),
    ColumnSpec::new(
        "additional_minutes",
        "Additional minutes of prep/follow-up",
        ValueKind::Number,
    ),
    ColumnSpec::new("edi", "Equity, Diversity, Inclusion (EDI)", ValueKind::SingleSelect),
];

const INSTRUCTION_OUTREACH_MULTISELECT: &[MultiselectField] = &[
    MultiselectField {
        source: "Topics covered",
        table: "libinsight_inst_topics_covered",
        column: "topics_covered",
    },
    MultiselectField {
        source: "Method of delivery",
        table: "libinsight_inst_method_of_delivery",
        column: "method_of_delivery",
    },
    MultiselectField {
        source: "Audience",
        table: "libinsight_inst_audience",
        column: "audience",
    },
    MultiselectField {
        source: "Skills taught",
        table: "libinsight_inst_skills_taught",
        column: "skills_taught",
    },
    MultiselectField {
        source: "Tools discussed",
        table: "libinsight_inst_tools_discussed",
        column: "tools_discussed",
    },
    MultiselectField {
        source: "Teaching Consultation Results",
        table: "libinsight_inst_teaching_consultation_results",
        column: "teaching_consultation_results",
    },
];

pub const INSTRUCTION_OUTREACH: SurveySchema = SurveySchema {
    main_table: "libinsight_inst_records",
    table_prefix: "libinsight_inst_",
    columns: INSTRUCTION_OUTREACH_COLUMNS,
    multiselect: INSTRUCTION_OUTREACH_MULTISELECT,
};

const HEAD_COUNTS_COLUMNS: &[ColumnSpec] = &[
    SUBMISSION_COLUMNS[0],
    SUBMISSION_COLUMNS[1],
    SUBMISSION_COLUMNS[2],
    ColumnSpec::new("floor", "Floor", ValueKind::SingleSelect),
    ColumnSpec::new("time_of_head_count", "Time of Head Count", ValueKind::SingleSelect),
    ColumnSpec::new("number_of_patrons", "Number of Patrons", ValueKind::Number),
    ColumnSpec::new(
        "desk_interaction_date_time",
        "Date and Time for Desk Interactions",
        ValueKind::Date,
    ),
    ColumnSpec::new(
        "transactions_in_hour",
        "Number of transactions in the hour",
        ValueKind::Number,
    ),
];

pub const HILL_HEAD_COUNTS: SurveySchema = SurveySchema {
    main_table: "libinsight_hill_headcounts",
    table_prefix: "libinsight_hill_headcounts",
    columns: HEAD_COUNTS_COLUMNS,
    multiselect: &[],
};

pub const GATE_COUNTS: CounterSchema = CounterSchema {
    table: "libinsight_gate_counts",
    timestamp: ColumnSpec::new("counted_at", "date", ValueKind::Date).required(),
    location: ColumnSpec::new("location", "gate_name", ValueKind::Text).required(),
    measure: ColumnSpec::new("visits", "count", ValueKind::Number),
};

pub const DEFAULT_GATE_COUNT_AGGREGATE: &str = "hour";

#[derive(Debug, Clone, Copy)]
pub enum DatasetShape {
    Survey(SurveySchema),
    Counter(CounterSchema),
}

#[derive(Debug, Clone, Copy)]
pub struct BuiltinDataset {
    pub key: &'static str,
    pub display_name: &'static str,
    pub shape: DatasetShape,
    /// LibInsight dataset and request ids; `None` when the deployment must supply them.
    pub dataset_id: Option<u32>,
    pub request_id: Option<u32>,
}

const BUILTIN_DATASETS: &[BuiltinDataset] = &[
    BuiltinDataset {
        key: "instruction-outreach",
        display_name: "Instruction & Outreach",
        shape: DatasetShape::Survey(INSTRUCTION_OUTREACH),
        dataset_id: Some(29168),
        request_id: Some(19),
    },
    BuiltinDataset {
        key: "hill-head-counts",
        display_name: "Hill Library Head Counts",
        shape: DatasetShape::Survey(HILL_HEAD_COUNTS),
        dataset_id: Some(31294),
        request_id: Some(20),
    },
    BuiltinDataset {
        key: "gate-counts",
        display_name: "Gate Counts",
        shape: DatasetShape::Counter(GATE_COUNTS),
        dataset_id: None,
        request_id: None,
    },
];

pub fn builtin_datasets() -> &'static [BuiltinDataset] {
    BUILTIN_DATASETS
}

pub fn builtin_dataset(key: &str) -> Option<&'static BuiltinDataset> {
    BUILTIN_DATASETS
        .iter()
        .find(|d| d.key.eq_ignore_ascii_case(key))
}

/// Source identifiers that replace a built-in dataset's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetOverrides {
    pub dataset_id: Option<u32>,
    pub request_id: Option<u32>,
    pub aggregate: Option<String>,
}

impl BuiltinDataset {
    pub fn target(&self, overrides: &TargetOverrides) -> Result<SourceTarget, AdapterError> {
        let dataset_id = overrides.dataset_id.or(self.dataset_id).ok_or_else(|| {
            AdapterError::Message(format!("dataset {} needs a dataset_id", self.key))
        })?;
        match self.shape {
            DatasetShape::Survey(_) => {
                let request_id = overrides.request_id.or(self.request_id).ok_or_else(|| {
                    AdapterError::Message(format!("dataset {} needs a request_id", self.key))
                })?;
                Ok(SourceTarget::CustomDataset {
                    dataset_id,
                    request_id,
                })
            }
            DatasetShape::Counter(_) => Ok(SourceTarget::GateCount {
                dataset_id,
                aggregate: overrides
                    .aggregate
                    .clone()
                    .unwrap_or_else(|| DEFAULT_GATE_COUNT_AGGREGATE.to_string()),
            }),
        }
    }

    pub fn adapter(&self, overrides: &TargetOverrides) -> Result<Box<dyn DatasetAdapter>, AdapterError> {
        let target = self.target(overrides)?;
        Ok(match self.shape {
            DatasetShape::Survey(schema) => Box::new(SurveyDataset::new(
                self.key,
                self.display_name,
                target,
                schema,
            )?),
            DatasetShape::Counter(schema) => Box::new(CounterDataset::new(
                self.key,
                self.display_name,
                target,
                schema,
            )?),
        })
    }
}

/// Adapter for a built-in dataset key, `None` if the key is unknown.
pub fn adapter_for_dataset(
    key: &str,
    overrides: &TargetOverrides,
) -> Option<Result<Box<dyn DatasetAdapter>, AdapterError>> {
    builtin_dataset(key).map(|dataset| dataset.adapter(overrides))
}
