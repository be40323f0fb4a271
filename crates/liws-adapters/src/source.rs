//! LibInsight reporting API: token exchange, paginated data-grid reads, gate-count overviews.

use std::future::Future;

use async_trait::async_trait;
use chrono::NaiveDate;
use liws_core::RawRecord;
use liws_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use crate::SourceTarget;

pub const DEFAULT_BASE_URL: &str = "https://pitt.libinsight.com/v1.0";

/// Guard against a source that never reports its last page.
const MAX_PAGES: u64 = 10_000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("libinsight returned an error response: {0}")]
    Api(String),
    #[error("authorization failed: {0}")]
    Auth(String),
    #[error("client is not authorized")]
    NotAuthorized,
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Supplies raw records for a dataset over an inclusive date range, in ascending start-date order.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_records(
        &self,
        target: &SourceTarget,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<RawRecord>, SourceError>;
}

/// Rejects `{"type": "error"}` envelopes and returns the payload.
pub fn check_response(response: JsonValue) -> Result<JsonValue, SourceError> {
    if response.get("type").and_then(JsonValue::as_str) == Some("error") {
        return Err(SourceError::Api(response.to_string()));
    }
    match response {
        JsonValue::Object(mut envelope) => envelope
            .remove("payload")
            .ok_or_else(|| SourceError::Malformed("response has no payload".to_string())),
        other => Err(SourceError::Malformed(format!(
            "expected an object, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataGridPage {
    pub records: Vec<RawRecord>,
    pub displayed_page: Option<u64>,
    pub total_pages: Option<u64>,
}

impl DataGridPage {
    pub fn is_last(&self) -> bool {
        if self.records.is_empty() {
            return true;
        }
        match (self.displayed_page, self.total_pages) {
            (Some(displayed), Some(total)) => displayed >= total,
            _ => true,
        }
    }
}

fn page_number(value: Option<&JsonValue>) -> Option<u64> {
    match value? {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn object_records(items: &[JsonValue]) -> Vec<RawRecord> {
    items
        .iter()
        .filter_map(|item| {
            let record = RawRecord::from_value(item.clone());
            if record.is_none() {
                warn!(%item, "skipping non-object record");
            }
            record
        })
        .collect()
}

pub fn parse_data_grid_page(response: JsonValue) -> Result<DataGridPage, SourceError> {
    let payload = check_response(response)?;
    let records = match payload.get("records") {
        Some(JsonValue::Array(items)) => object_records(items),
        Some(JsonValue::Null) | None => Vec::new(),
        Some(other) => {
            return Err(SourceError::Malformed(format!(
                "payload.records is not an array: {other}"
            )))
        }
    };
    Ok(DataGridPage {
        records,
        displayed_page: page_number(payload.get("displayed_page")),
        total_pages: page_number(payload.get("total_pages")),
    })
}

/// Walks pages from 1 until the source reports its last page.
pub async fn collect_pages<F, Fut>(mut fetch_page: F) -> Result<Vec<RawRecord>, SourceError>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<JsonValue, SourceError>>,
{
    let mut records = Vec::new();
    for page in 1..=MAX_PAGES {
        let parsed = parse_data_grid_page(fetch_page(page).await?)?;
        debug!(
            page,
            total_pages = ?parsed.total_pages,
            records = parsed.records.len(),
            "fetched data-grid page"
        );
        let last = parsed.is_last();
        records.extend(parsed.records);
        if last {
            return Ok(records);
        }
    }
    Err(SourceError::Malformed(format!(
        "no last page after {MAX_PAGES} pages"
    )))
}

/// Flattens a gate-count payload into one raw record per count object.
pub fn gate_count_records(payload: &JsonValue) -> Vec<RawRecord> {
    let items = match payload {
        JsonValue::Array(items) => Some(items),
        JsonValue::Object(fields) => ["data", "records"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(JsonValue::as_array)),
        _ => None,
    };
    items.map(|items| object_records(items)).unwrap_or_default()
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Client for one LibInsight instance.
#[derive(Debug, Clone)]
pub struct LibInsightClient {
    base_url: String,
    http: HttpFetcher,
    access_token: Option<String>,
}

impl LibInsightClient {
    pub fn new(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            access_token: None,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn token(&self) -> Result<&str, SourceError> {
        self.access_token
            .as_deref()
            .ok_or(SourceError::NotAuthorized)
    }

    /// Client-credentials token exchange; the token authorizes every later call.
    pub async fn authorize(&mut self, client_id: &str, client_secret: &str) -> Result<(), SourceError> {
        let response = self
            .http
            .post_form_json(
                &self.url("oauth/token"),
                &[
                    ("client_id", client_id),
                    ("client_secret", client_secret),
                    ("grant_type", "client_credentials"),
                ],
            )
            .await
            .map_err(|err| SourceError::Auth(err.to_string()))?;
        let token = response
            .get("access_token")
            .and_then(JsonValue::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SourceError::Auth("token response has no access_token".to_string()))?;
        self.access_token = Some(token.to_string());
        Ok(())
    }

    pub async fn custom_dataset_records(
        &self,
        dataset_id: u32,
        request_id: u32,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let token = self.token()?;
        let url = self.url(&format!("custom-dataset/{dataset_id}/data-grid"));
        collect_pages(|page| {
            let query = vec![
                ("request_id", request_id.to_string()),
                ("from", format_date(from)),
                ("to", format_date(to)),
                ("entered_by", "all".to_string()),
                ("sort", "asc".to_string()),
                ("page", page.to_string()),
            ];
            let url = url.clone();
            async move {
                self.http
                    .get_json(&url, &query, Some(token))
                    .await
                    .map_err(SourceError::from)
            }
        })
        .await
    }

    pub async fn gate_count_overview(
        &self,
        dataset_id: u32,
        from: NaiveDate,
        to: NaiveDate,
        aggregate: &str,
    ) -> Result<JsonValue, SourceError> {
        let token = self.token()?;
        let query = [
            ("from", format_date(from)),
            ("to", format_date(to)),
            ("aggregate", aggregate.to_string()),
        ];
        let response = self
            .http
            .get_json(
                &self.url(&format!("gate-count/{dataset_id}/overview")),
                &query,
                Some(token),
            )
            .await?;
        check_response(response)
    }
}

#[async_trait]
impl RecordSource for LibInsightClient {
    async fn fetch_records(
        &self,
        target: &SourceTarget,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<RawRecord>, SourceError> {
        match target {
            SourceTarget::CustomDataset {
                dataset_id,
                request_id,
            } => {
                self.custom_dataset_records(*dataset_id, *request_id, from, to)
                    .await
            }
            SourceTarget::GateCount {
                dataset_id,
                aggregate,
            } => {
                let payload = self
                    .gate_count_overview(*dataset_id, from, to, aggregate)
                    .await?;
                Ok(gate_count_records(&payload))
            }
        }
    }
}
