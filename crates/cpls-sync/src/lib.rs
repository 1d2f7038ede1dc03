//! Remote reconciliation and run orchestration for CPLS.

mod directors;

pub use directors::{
    build_director_key, normalise_name, parse_director_names, run_director_explode,
    DirectorExplodeOutcome, DIRECTOR_ENRICHMENT_TABLE,
};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpls_adapters::{default_sources, parse_csv, SourceSpec};
use cpls_core::{
    resolve_field, FetchOutcome, Row, RunStatus, LEGACY_LOCATION_ID_FIELD, LOCATION_ID_CANDIDATES,
    LOCATION_ID_FIELD,
};
use cpls_enrich::{
    CompaniesHouseClient, CqcApiClient, Enricher, EnrichmentConfig, EnrichmentStats,
};
use cpls_storage::{CsvFetcher, DataDir, FetcherConfig};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpls-sync";

pub const LEADS_TABLE: &str = "Leads";

/// The remote store accepts at most this many records per write call.
pub const BATCH_SIZE: usize = 10;

/// Downloaded exports are kept locally for this long.
const EXPORT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("remote store returned status {status} during {operation}: {body}")]
    HttpStatus {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("invalid store url: {0}")]
    Url(String),
}

/// One record as held by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub id: String,
    pub fields: Map<String, Value>,
}

/// Paged list + batched create/update against the remote record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_records(
        &self,
        table: &str,
        fields: &[&str],
    ) -> Result<Vec<RemoteRecord>, StoreError>;

    async fn create_batch(
        &self,
        table: &str,
        batch: &[Map<String, Value>],
    ) -> Result<usize, StoreError>;

    async fn update_batch(
        &self,
        table: &str,
        batch: &[(String, Map<String, Value>)],
    ) -> Result<usize, StoreError>;
}

#[derive(Debug, Deserialize)]
struct ListBody {
    #[serde(default)]
    records: Vec<ApiRecord>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiRecord {
    id: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct WriteBody {
    #[serde(default)]
    records: Vec<Value>,
}

/// Airtable-style REST store: bearer auth, opaque `offset` paging, writes in
/// `{"records": [{"fields": ...}]}` envelopes.
#[derive(Debug, Clone)]
pub struct AirtableStore {
    client: reqwest::Client,
    base_url: String,
    base_id: String,
    token: String,
}

impl AirtableStore {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        base_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            base_id: base_id.into(),
            token: token.into(),
        }
    }

    fn table_url(&self, table: &str) -> Result<Url, StoreError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|err| StoreError::Url(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Url(format!("{} cannot be a base url", self.base_url)))?
            .push("v0")
            .push(&self.base_id)
            .push(table);
        Ok(url)
    }
}

async fn check_status(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::HttpStatus {
        operation,
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl RecordStore for AirtableStore {
    async fn list_records(
        &self,
        table: &str,
        fields: &[&str],
    ) -> Result<Vec<RemoteRecord>, StoreError> {
        let url = self.table_url(table)?;
        let mut records = Vec::new();
        let mut offset: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = vec![("pageSize", "100".to_string())];
            for field in fields {
                query.push(("fields[]", (*field).to_string()));
            }
            if let Some(cursor) = &offset {
                query.push(("offset", cursor.clone()));
            }

            let response = self
                .client
                .get(url.clone())
                .bearer_auth(&self.token)
                .query(&query)
                .send()
                .await?;
            let response = check_status("list", response).await?;
            let body: ListBody = response.json().await?;

            records.extend(
                body.records
                    .into_iter()
                    .map(|record| RemoteRecord {
                        id: record.id,
                        fields: record.fields,
                    }),
            );

            match body.offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        Ok(records)
    }

    async fn create_batch(
        &self,
        table: &str,
        batch: &[Map<String, Value>],
    ) -> Result<usize, StoreError> {
        let url = self.table_url(table)?;
        let payload = serde_json::json!({
            "records": batch
                .iter()
                .map(|fields| serde_json::json!({"fields": fields}))
                .collect::<Vec<_>>(),
        });
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;
        let response = check_status("create", response).await?;
        let body: WriteBody = response.json().await?;
        Ok(body.records.len())
    }

    async fn update_batch(
        &self,
        table: &str,
        batch: &[(String, Map<String, Value>)],
    ) -> Result<usize, StoreError> {
        let url = self.table_url(table)?;
        let payload = serde_json::json!({
            "records": batch
                .iter()
                .map(|(id, fields)| serde_json::json!({"id": id, "fields": fields}))
                .collect::<Vec<_>>(),
        });
        let response = self
            .client
            .patch(url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;
        let response = check_status("update", response).await?;
        let body: WriteBody = response.json().await?;
        Ok(body.records.len())
    }
}

/// Opaque handle to an existing remote Leads record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    pub record_id: String,
}

/// Snapshot of the remote store, keyed by location id. Built once per run.
pub type RemoteIndex = HashMap<String, RecordHandle>;

/// Counterpart of [`cpls_core::resolve_field`] for remote JSON field maps.
pub fn json_field_str<'a>(fields: &'a Map<String, Value>, candidates: &[&str]) -> Option<&'a str> {
    for key in candidates {
        if let Some(value) = fields.get(*key).and_then(Value::as_str) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
    }
    None
}

/// Page through the Leads table and map location ids to record handles.
///
/// Any store failure aborts the whole build: reconciling against a partial
/// index would create false duplicates.
pub async fn build_location_index(store: &dyn RecordStore) -> Result<RemoteIndex, StoreError> {
    let records = store.list_records(LEADS_TABLE, LOCATION_ID_CANDIDATES).await?;
    let mut index = RemoteIndex::new();
    for record in records {
        let Some(location_id) = json_field_str(&record.fields, LOCATION_ID_CANDIDATES) else {
            continue;
        };
        index
            .entry(location_id.to_string())
            .or_insert(RecordHandle {
                record_id: record.id,
            });
    }
    Ok(index)
}

/// Fold the legacy identifier column into the current one so the remote store
/// never sees the unrecognized field name.
pub fn normalize_legacy_fields(row: &mut Row) {
    if let Some(legacy) = row.remove(LEGACY_LOCATION_ID_FIELD) {
        let current_blank = row
            .get(LOCATION_ID_FIELD)
            .map(|value| value.trim().is_empty())
            .unwrap_or(true);
        if current_blank && !legacy.trim().is_empty() {
            row.insert(LOCATION_ID_FIELD.to_string(), legacy);
        }
    }
}

fn row_to_fields(row: &Row) -> Map<String, Value> {
    row.iter()
        .map(|(key, value)| (key.clone(), Value::String(value.clone())))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub created: usize,
    pub updated: usize,
    pub skipped_no_id: usize,
    pub duplicates: usize,
}

/// Diff rows against the remote index and submit creates/updates in bounded
/// batches. Any write failure aborts the remaining batches immediately;
/// retries belong to the transport, not here.
pub async fn reconcile(
    store: &dyn RecordStore,
    rows: Vec<Row>,
    index: &RemoteIndex,
) -> Result<ReconcileOutcome, StoreError> {
    let mut outcome = ReconcileOutcome::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut creates: Vec<Map<String, Value>> = Vec::new();
    let mut updates: Vec<(String, Map<String, Value>)> = Vec::new();

    for mut row in rows {
        normalize_legacy_fields(&mut row);
        let Some(location_id) = resolve_field(&row, &[LOCATION_ID_FIELD]).map(str::to_string)
        else {
            outcome.skipped_no_id += 1;
            continue;
        };
        if !seen.insert(location_id.clone()) {
            outcome.duplicates += 1;
            continue;
        }
        let fields = row_to_fields(&row);
        match index.get(&location_id) {
            Some(handle) => updates.push((handle.record_id.clone(), fields)),
            None => creates.push(fields),
        }
    }

    info!(
        creates = creates.len(),
        updates = updates.len(),
        skipped = outcome.skipped_no_id,
        duplicates = outcome.duplicates,
        "partitioned rows for submission"
    );

    for batch in creates.chunks(BATCH_SIZE) {
        outcome.created += store.create_batch(LEADS_TABLE, batch).await?;
    }
    for batch in updates.chunks(BATCH_SIZE) {
        outcome.updated += store.update_batch(LEADS_TABLE, batch).await?;
    }

    Ok(outcome)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub run_token: String,
    pub port: u16,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub airtable_base_url: String,
    pub airtable_base_id: String,
    pub airtable_token: String,
    pub cqc_api_base_url: String,
    pub companies_house_base_url: String,
    pub companies_house_api_key: String,
    pub enrichment: EnrichmentConfig,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            run_token: std::env::var("RUN_TOKEN").unwrap_or_default(),
            port: std::env::var("PORT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(10000),
            user_agent: std::env::var("CPLS_USER_AGENT")
                .unwrap_or_else(|_| cpls_storage::BROWSER_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("CPLS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(30),
            airtable_base_url: std::env::var("AIRTABLE_BASE_URL")
                .unwrap_or_else(|_| "https://api.airtable.com".to_string()),
            airtable_base_id: std::env::var("AIRTABLE_BASE_ID").unwrap_or_default(),
            airtable_token: std::env::var("AIRTABLE_TOKEN").unwrap_or_default(),
            cqc_api_base_url: std::env::var("CQC_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.service.cqc.org.uk/public/v1".to_string()),
            companies_house_base_url: std::env::var("COMPANIES_HOUSE_BASE_URL").unwrap_or_else(
                |_| "https://api.company-information.service.gov.uk".to_string(),
            ),
            companies_house_api_key: std::env::var("COMPANIES_HOUSE_API_KEY").unwrap_or_default(),
            enrichment: EnrichmentConfig::default(),
            scheduler_enabled: std::env::var("CPLS_SCHEDULER_ENABLED")
                .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 6 * * *".to_string()),
        }
    }
}

/// Outcome of one source download within a run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub file: Option<String>,
    pub path: PathBuf,
    pub ok: bool,
    pub bytes: u64,
    pub lines: u64,
    pub sha256: Option<String>,
    pub error: Option<String>,
}

impl SourceReport {
    fn new(source: &SourceSpec, filename: String, path: PathBuf, outcome: FetchOutcome) -> Self {
        let error = (!outcome.ok).then(|| outcome.message.clone());
        Self {
            source_id: source.source_id.clone(),
            file: outcome.ok.then_some(filename),
            path,
            ok: outcome.ok,
            bytes: outcome.bytes,
            lines: outcome.lines,
            sha256: outcome.sha256,
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub sources: Vec<SourceReport>,
    pub rows_parsed: usize,
    pub enrichment: EnrichmentStats,
    pub reconcile: ReconcileOutcome,
}

impl RunSummary {
    fn failed(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        sources: Vec<SourceReport>,
        error: &str,
    ) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status: RunStatus::Error,
            error: Some(error.to_string()),
            sources,
            rows_parsed: 0,
            enrichment: EnrichmentStats::default(),
            reconcile: ReconcileOutcome::default(),
        }
    }
}

/// Fetch, parse, enrich, and reconcile the weekly exports.
#[derive(Debug, Clone)]
pub struct JobPipeline {
    config: SyncConfig,
    data_dir: DataDir,
    fetcher: CsvFetcher,
    http: reqwest::Client,
    sources: Vec<SourceSpec>,
}

impl JobPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let data_dir = DataDir::new(&config.data_dir);
        let fetcher = CsvFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            ..FetcherConfig::default()
        })?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("building API client")?;
        Ok(Self {
            config,
            data_dir,
            fetcher,
            http,
            sources: default_sources(),
        })
    }

    pub fn with_sources(mut self, sources: Vec<SourceSpec>) -> Self {
        self.sources = sources;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn record_store(&self) -> AirtableStore {
        AirtableStore::new(
            self.http.clone(),
            self.config.airtable_base_url.clone(),
            self.config.airtable_base_id.clone(),
            self.config.airtable_token.clone(),
        )
    }

    /// Download every source to a timestamped file, then prune aged exports.
    /// Each source succeeds or fails independently.
    pub async fn run_downloads(&self) -> Result<Vec<SourceReport>> {
        self.data_dir.ensure().await?;
        let mut reports = Vec::new();

        for source in &self.sources {
            let stamp = Utc::now();
            let filename = DataDir::csv_filename(&source.filename_prefix, stamp);
            let path = self.data_dir.root().join(&filename);
            info!(source_id = %source.source_id, path = %path.display(), "downloading export");
            let outcome = self.fetcher.fetch(&source.url, &path).await;
            reports.push(SourceReport::new(source, filename, path, outcome));
        }

        self.data_dir.cleanup_older_than(EXPORT_RETENTION).await;
        Ok(reports)
    }

    /// Full ingestion + sync run. Any source failure blocks the sync phase:
    /// reconciling a partial dataset would misclassify missing rows.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "starting ingestion and sync run");

        let reports = self.run_downloads().await?;
        if reports.iter().any(|report| !report.ok) {
            warn!("one or more downloads failed; skipping sync phase");
            return Ok(RunSummary::failed(
                run_id,
                started_at,
                reports,
                "one or more source downloads failed",
            ));
        }

        if self.config.airtable_token.trim().is_empty() {
            warn!("remote store token is not set; cannot sync");
            return Ok(RunSummary::failed(
                run_id,
                started_at,
                reports,
                "remote store token is not configured",
            ));
        }

        let mut rows = Vec::new();
        for report in &reports {
            let parsed = parse_csv(&report.path);
            info!(source_id = %report.source_id, rows = parsed.len(), "parsed export");
            rows.extend(parsed);
        }
        let rows_parsed = rows.len();

        let cqc = CqcApiClient::new(self.http.clone(), self.config.cqc_api_base_url.clone());
        let companies = CompaniesHouseClient::new(
            self.http.clone(),
            self.config.companies_house_base_url.clone(),
            self.config.companies_house_api_key.clone(),
        );
        let mut enricher = Enricher::new(&cqc, &companies, self.config.enrichment.clone());
        let (rows, enrichment) = enricher.process(rows).await;

        let store = self.record_store();
        let index = build_location_index(&store)
            .await
            .context("building remote location index")?;
        info!(existing = index.len(), "built remote location index");

        let reconcile_outcome = reconcile(&store, rows, &index)
            .await
            .context("reconciling rows against remote store")?;

        let finished_at = Utc::now();
        info!(
            created = reconcile_outcome.created,
            updated = reconcile_outcome.updated,
            "run complete"
        );
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            status: RunStatus::Ok,
            error: None,
            sources: reports,
            rows_parsed,
            enrichment,
            reconcile: reconcile_outcome,
        })
    }
}

pub async fn run_job_once(config: SyncConfig) -> Result<RunSummary> {
    JobPipeline::new(config)?.run_once().await
}

pub async fn run_job_once_from_env() -> Result<RunSummary> {
    run_job_once(SyncConfig::from_env()).await
}

/// Build (but do not start) the cron scheduler when enabled by configuration.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let job_config = config.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let config = job_config.clone();
        Box::pin(async move {
            match run_job_once(config).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    status = summary.status.as_str(),
                    created = summary.reconcile.created,
                    updated = summary.reconcile.updated,
                    "scheduled run finished"
                ),
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
