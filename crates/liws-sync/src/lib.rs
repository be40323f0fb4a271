//! Sync orchestration: configuration, the dataset registry, runs and the scheduler.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};
use liws_adapters::{
    builtin_dataset, builtin_datasets, AdapterError, DatasetAdapter, LibInsightClient,
    RecordSource, TargetOverrides,
};
use liws_storage::{connect_store, redact_url, HttpClientConfig, HttpFetcher, Store};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub mod engine;

pub use engine::{reconcile, DatasetRunSummary, DatasetSync, ReconcileOutcome};

pub const CRATE_NAME: &str = "liws-sync";
pub const REGISTRY_FILE: &str = "datasets.yaml";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0} is not set")]
    MissingSetting(&'static str),
    #[error("unknown dataset `{0}`")]
    UnknownDataset(String),
    #[error("dataset `{0}` is not enabled in the registry")]
    DatasetDisabled(String),
    #[error("date window starts {from} after it ends {to}")]
    InvalidWindow { from: NaiveDate, to: NaiveDate },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub libinsight_base_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://liws.db?mode=rwc".to_string()),
            libinsight_base_url: var("LIBINSIGHT_BASE_URL")
                .unwrap_or_else(|| liws_adapters::source::DEFAULT_BASE_URL.to_string()),
            client_id: var("LIBINSIGHT_CLIENT_ID"),
            client_secret: var("LIBINSIGHT_CLIENT_SECRET"),
            http_timeout_secs: var("LIWS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: var("LIWS_USER_AGENT").unwrap_or_else(|| "liws/0.1".to_string()),
            scheduler_enabled: var("LIWS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: var("LIWS_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            workspace_root: var("LIWS_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn credentials(&self) -> Result<(&str, &str), SyncError> {
        let id = self
            .client_id
            .as_deref()
            .ok_or(SyncError::MissingSetting("LIBINSIGHT_CLIENT_ID"))?;
        let secret = self
            .client_secret
            .as_deref()
            .ok_or(SyncError::MissingSetting("LIBINSIGHT_CLIENT_SECRET"))?;
        Ok((id, secret))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join(REGISTRY_FILE)
    }
}

/// Inclusive date range for one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl SyncWindow {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, SyncError> {
        if from > to {
            return Err(SyncError::InvalidWindow { from, to });
        }
        Ok(Self { from, to })
    }

    /// July 1 of the prior calendar year through `today`.
    pub fn fiscal_year_default(today: NaiveDate) -> Self {
        let from = NaiveDate::from_ymd_opt(today.year() - 1, 7, 1).unwrap_or(today);
        Self { from, to: today }
    }

    /// Explicit bounds win; a missing bound comes from the fiscal-year default.
    pub fn resolve(
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<Self, SyncError> {
        let default = Self::fiscal_year_default(today);
        Self::new(from.unwrap_or(default.from), to.unwrap_or(default.to))
    }
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DatasetEntry {
    pub dataset: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub dataset_id: Option<u32>,
    #[serde(default)]
    pub request_id: Option<u32>,
    #[serde(default)]
    pub aggregate: Option<String>,
}

impl DatasetEntry {
    pub fn overrides(&self) -> TargetOverrides {
        TargetOverrides {
            dataset_id: self.dataset_id,
            request_id: self.request_id,
            aggregate: self.aggregate.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetEntry>,
}

impl DatasetRegistry {
    /// Every built-in dataset, enabled when its source identifiers are known without configuration.
    pub fn builtin_defaults() -> Self {
        Self {
            datasets: builtin_datasets()
                .iter()
                .map(|d| DatasetEntry {
                    dataset: d.key.to_string(),
                    enabled: d.dataset_id.is_some(),
                    dataset_id: None,
                    request_id: None,
                    aggregate: None,
                })
                .collect(),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing dataset registry")?;
        for entry in &registry.datasets {
            if builtin_dataset(&entry.dataset).is_none() {
                return Err(SyncError::UnknownDataset(entry.dataset.clone()).into());
            }
        }
        Ok(registry)
    }

    /// Reads the registry file; a missing file means the built-in defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text).with_context(|| format!("loading {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no dataset registry, using built-in datasets");
                Ok(Self::builtin_defaults())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn entry(&self, key: &str) -> Option<&DatasetEntry> {
        self.datasets
            .iter()
            .find(|e| e.dataset.eq_ignore_ascii_case(key))
    }

    /// Adapters for the selected keys, or for every enabled entry when nothing is selected.
    pub fn adapters(&self, selected: &[String]) -> Result<Vec<Box<dyn DatasetAdapter>>, SyncError> {
        let entries: Vec<&DatasetEntry> = if selected.is_empty() {
            self.datasets.iter().filter(|e| e.enabled).collect()
        } else {
            selected
                .iter()
                .map(|key| match self.entry(key) {
                    Some(entry) if entry.enabled => Ok(entry),
                    Some(_) => Err(SyncError::DatasetDisabled(key.clone())),
                    None if builtin_dataset(key).is_some() => {
                        Err(SyncError::DatasetDisabled(key.clone()))
                    }
                    None => Err(SyncError::UnknownDataset(key.clone())),
                })
                .collect::<Result<_, _>>()?
        };

        entries
            .into_iter()
            .map(|entry| {
                let builtin = builtin_dataset(&entry.dataset)
                    .ok_or_else(|| SyncError::UnknownDataset(entry.dataset.clone()))?;
                Ok(builtin.adapter(&entry.overrides())?)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: SyncWindow,
    pub datasets: Vec<DatasetRunSummary>,
}

impl SyncRunSummary {
    pub fn total(&self, field: fn(&DatasetRunSummary) -> usize) -> usize {
        self.datasets.iter().map(field).sum()
    }

    pub fn failed_records(&self) -> usize {
        self.total(|d| d.failed)
    }
}

/// Runs each adapter in order against one store and source. The first setup error aborts the run.
pub async fn run_datasets(
    adapters: &[Box<dyn DatasetAdapter>],
    store: &dyn Store,
    source: &dyn RecordSource,
    window: SyncWindow,
) -> Result<SyncRunSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("sync_run", %run_id);
    async move {
        info!(datasets = adapters.len(), from = %window.from, to = %window.to, "sync started");
        // Every table and every fetch must succeed before the first record is written.
        let created = ensure_schemas(adapters, store).await?;
        let mut batches = Vec::with_capacity(adapters.len());
        for (adapter, (_, created_tables)) in adapters.iter().zip(created) {
            let sync = DatasetSync::new(adapter.as_ref(), store, source);
            let records = sync
                .fetch(window.from, window.to)
                .await
                .with_context(|| format!("syncing {}", adapter.display_name()))?;
            batches.push((sync, created_tables, records));
        }

        let mut datasets = Vec::with_capacity(batches.len());
        for (sync, created_tables, records) in batches {
            let summary = sync
                .reconcile_batch(created_tables, &records, window.from, window.to)
                .await;
            datasets.push(summary);
        }
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            window,
            datasets,
        };
        info!(
            inserted = summary.total(|d| d.inserted),
            updated = summary.total(|d| d.updated),
            skipped = summary.total(|d| d.skipped),
            failed = summary.failed_records(),
            "sync finished"
        );
        Ok(summary)
    }
    .instrument(span)
    .await
}

/// Creates any missing tables for the adapters; returns (dataset, created tables) pairs.
pub async fn ensure_schemas(
    adapters: &[Box<dyn DatasetAdapter>],
    store: &dyn Store,
) -> Result<Vec<(String, Vec<String>)>> {
    let mut created = Vec::with_capacity(adapters.len());
    for adapter in adapters {
        let tables = adapter
            .ensure_schema(store)
            .await
            .with_context(|| format!("creating tables for {}", adapter.key()))?;
        created.push((adapter.key().to_string(), tables));
    }
    Ok(created)
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn load_registry(&self) -> Result<DatasetRegistry> {
        DatasetRegistry::load(&self.config.registry_path()).await
    }

    async fn connect(&self) -> Result<Box<dyn Store>> {
        connect_store(&self.config.database_url)
            .await
            .with_context(|| format!("connecting to {}", redact_url(&self.config.database_url)))
    }

    /// Authorizes, connects, then syncs the selected (or all enabled) datasets over `window`.
    pub async fn run_once(&self, window: SyncWindow, selected: &[String]) -> Result<SyncRunSummary> {
        let adapters = self.load_registry().await?.adapters(selected)?;
        let (client_id, client_secret) = self.config.credentials()?;

        let mut client = LibInsightClient::new(&self.config.libinsight_base_url, self.http.clone());
        client
            .authorize(client_id, client_secret)
            .await
            .context("authorizing with LibInsight")?;

        let store = self.connect().await?;
        let result = run_datasets(&adapters, store.as_ref(), &client, window).await;
        store.close().await;
        result
    }

    /// Creates missing tables without contacting LibInsight.
    pub async fn ensure_schemas(&self, selected: &[String]) -> Result<Vec<(String, Vec<String>)>> {
        let adapters = self.load_registry().await?.adapters(selected)?;
        let store = self.connect().await?;
        let result = ensure_schemas(&adapters, store.as_ref()).await;
        store.close().await;
        result
    }

    /// Cron-driven default-window sync of every enabled dataset, when the scheduler is enabled.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let config = self.config.clone();
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let config = config.clone();
            Box::pin(async move {
                let today = Local::now().date_naive();
                match run_sync_once(config, SyncWindow::fiscal_year_default(today), &[]).await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync complete"),
                    Err(err) => error!("scheduled sync failed: {err:#}"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once(
    config: SyncConfig,
    window: SyncWindow,
    selected: &[String],
) -> Result<SyncRunSummary> {
    SyncPipeline::new(config)?.run_once(window, selected).await
}

/// Runs the scheduler until ctrl-c. Errors if the scheduler is disabled.
pub async fn run_scheduler_until_shutdown(config: SyncConfig) -> Result<()> {
    let cron = config.sync_cron.clone();
    let pipeline = SyncPipeline::new(config)?;
    let mut sched = pipeline
        .maybe_build_scheduler()
        .await?
        .ok_or(SyncError::MissingSetting("LIWS_SCHEDULER_ENABLED"))?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}
