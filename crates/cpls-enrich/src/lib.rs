//! Site-count filtering and company-registry enrichment for parsed lead rows.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use cpls_core::{resolve_field, Row, PROVIDER_ID_CANDIDATES, PROVIDER_NAME_CANDIDATES};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "cpls-enrich";

/// Sentinel meaning the lookup chain never completed for this row.
pub const NOT_FOUND: &str = "NOT FOUND";

/// Sentinel meaning the lookup completed but listed no active officers.
pub const NONE_LISTED: &str = "None";

pub const SITES_FIELD: &str = "Sites";
pub const COMPANY_NUMBER_FIELD: &str = "Company Number";
pub const REGISTERED_ADDRESS_FIELD: &str = "Registered Address";
pub const ACTIVE_DIRECTORS_FIELD: &str = "Active Directors";
pub const ACTIVE_SECRETARIES_FIELD: &str = "Active Secretaries";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{service} returned status {status}")]
    HttpStatus { service: &'static str, status: u16 },
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

/// Resolves the number of sites registered to a provider.
#[async_trait]
pub trait SiteLookup: Send + Sync {
    async fn site_count(&self, provider_id: &str) -> Result<u32, LookupError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyHit {
    pub title: String,
    pub company_number: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompanyProfile {
    pub registered_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Officer {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub officer_role: String,
    #[serde(default)]
    pub resigned_on: Option<String>,
}

impl Officer {
    pub fn is_active(&self) -> bool {
        self.resigned_on.is_none()
    }

    pub fn is_director(&self) -> bool {
        self.officer_role.to_ascii_lowercase().contains("director")
    }

    pub fn is_secretary(&self) -> bool {
        self.officer_role.to_ascii_lowercase().contains("secretary")
    }
}

/// Three chained company-registry lookups, each independently failable.
#[async_trait]
pub trait CompanyRegistry: Send + Sync {
    async fn search_top(&self, name: &str) -> Result<Option<CompanyHit>, LookupError>;
    async fn profile(&self, company_number: &str) -> Result<CompanyProfile, LookupError>;
    async fn officers(&self, company_number: &str) -> Result<Vec<Officer>, LookupError>;
}

/// CQC public API client: the provider record's `locationIds` list length is
/// the site count.
#[derive(Debug, Clone)]
pub struct CqcApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl CqcApiClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SiteLookup for CqcApiClient {
    async fn site_count(&self, provider_id: &str) -> Result<u32, LookupError> {
        let url = format!("{}/providers/{provider_id}", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(LookupError::HttpStatus {
                service: "cqc",
                status: response.status().as_u16(),
            });
        }
        let body: serde_json::Value = response.json().await?;
        let locations = body
            .get("locationIds")
            .and_then(|value| value.as_array())
            .ok_or_else(|| LookupError::Shape("provider record has no locationIds list".into()))?;
        Ok(locations.len() as u32)
    }
}

/// Companies House client covering search, profile, and officer listing.
#[derive(Debug, Clone)]
pub struct CompaniesHouseClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    company_number: String,
}

#[derive(Debug, Deserialize)]
struct ProfileBody {
    #[serde(default)]
    registered_office_address: Option<RegisteredAddress>,
}

#[derive(Debug, Default, Deserialize)]
struct RegisteredAddress {
    #[serde(default)]
    address_line_1: Option<String>,
    #[serde(default)]
    address_line_2: Option<String>,
    #[serde(default)]
    locality: Option<String>,
    #[serde(default)]
    postal_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OfficersPage {
    #[serde(default)]
    items: Vec<Officer>,
}

impl CompaniesHouseClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, LookupError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .basic_auth(&self.api_key, Some(""))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LookupError::HttpStatus {
                service: "companies-house",
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl CompanyRegistry for CompaniesHouseClient {
    async fn search_top(&self, name: &str) -> Result<Option<CompanyHit>, LookupError> {
        let url = format!("{}/search/companies", self.base_url);
        let page: SearchPage = self
            .get_json(&url, &[("q", name), ("items_per_page", "1")])
            .await?;
        Ok(page.items.into_iter().next().map(|item| CompanyHit {
            title: item.title,
            company_number: item.company_number,
        }))
    }

    async fn profile(&self, company_number: &str) -> Result<CompanyProfile, LookupError> {
        let url = format!("{}/company/{company_number}", self.base_url);
        let body: ProfileBody = self.get_json(&url, &[]).await?;
        Ok(CompanyProfile {
            registered_address: body.registered_office_address.and_then(|address| {
                let parts: Vec<String> = [
                    address.address_line_1,
                    address.address_line_2,
                    address.locality,
                    address.postal_code,
                ]
                .into_iter()
                .flatten()
                .filter(|part| !part.trim().is_empty())
                .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(", "))
                }
            }),
        })
    }

    async fn officers(&self, company_number: &str) -> Result<Vec<Officer>, LookupError> {
        let url = format!("{}/company/{company_number}/officers", self.base_url);
        let page: OfficersPage = self.get_json(&url, &[]).await?;
        Ok(page.items)
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Providers with more sites than this are dropped.
    pub site_threshold: u32,
    /// Pause between rows so third-party rate limits are respected.
    pub inter_row_delay: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            site_threshold: 7,
            inter_row_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentStats {
    pub processed: usize,
    pub kept: usize,
    pub skipped_no_provider_id: usize,
    pub dropped_site_lookup_failed: usize,
    pub dropped_over_threshold: usize,
}

/// Filters rows by site count and stamps surviving rows with registry data.
///
/// The site-count cache lives for one pipeline run; it memoizes successful
/// lookups only.
pub struct Enricher<'a> {
    sites: &'a dyn SiteLookup,
    companies: &'a dyn CompanyRegistry,
    config: EnrichmentConfig,
    site_cache: HashMap<String, u32>,
}

impl<'a> Enricher<'a> {
    pub fn new(
        sites: &'a dyn SiteLookup,
        companies: &'a dyn CompanyRegistry,
        config: EnrichmentConfig,
    ) -> Self {
        Self {
            sites,
            companies,
            config,
            site_cache: HashMap::new(),
        }
    }

    pub async fn process(&mut self, rows: Vec<Row>) -> (Vec<Row>, EnrichmentStats) {
        let mut stats = EnrichmentStats::default();
        let mut kept = Vec::new();

        for mut row in rows {
            stats.processed += 1;

            let Some(provider_id) = resolve_field(&row, PROVIDER_ID_CANDIDATES).map(str::to_string)
            else {
                debug!("row has no resolvable provider id, skipping");
                stats.skipped_no_provider_id += 1;
                continue;
            };

            let site_count = match self.cached_site_count(&provider_id).await {
                Some(count) => count,
                None => {
                    stats.dropped_site_lookup_failed += 1;
                    continue;
                }
            };

            if site_count > self.config.site_threshold {
                debug!(provider_id = %provider_id, site_count, "provider over site threshold, dropping");
                stats.dropped_over_threshold += 1;
                continue;
            }

            row.insert(SITES_FIELD.to_string(), site_count.to_string());
            for field in [
                COMPANY_NUMBER_FIELD,
                REGISTERED_ADDRESS_FIELD,
                ACTIVE_DIRECTORS_FIELD,
                ACTIVE_SECRETARIES_FIELD,
            ] {
                row.insert(field.to_string(), NOT_FOUND.to_string());
            }

            match resolve_field(&row, PROVIDER_NAME_CANDIDATES).map(str::to_string) {
                Some(name) => self.apply_company_enrichment(&mut row, &name).await,
                None => debug!(provider_id = %provider_id, "no search name, keeping placeholders"),
            }

            stats.kept += 1;
            kept.push(row);

            if !self.config.inter_row_delay.is_zero() {
                tokio::time::sleep(self.config.inter_row_delay).await;
            }
        }

        (kept, stats)
    }

    /// Successful lookups are memoized; failures are not, so a later row for
    /// the same provider gets a fresh attempt.
    async fn cached_site_count(&mut self, provider_id: &str) -> Option<u32> {
        if let Some(count) = self.site_cache.get(provider_id) {
            return Some(*count);
        }
        match self.sites.site_count(provider_id).await {
            Ok(count) => {
                self.site_cache.insert(provider_id.to_string(), count);
                Some(count)
            }
            Err(err) => {
                warn!(provider_id, error = %err, "site-count lookup failed, dropping row");
                None
            }
        }
    }

    /// Best effort: each step that fails leaves the fields written so far and
    /// keeps the row.
    async fn apply_company_enrichment(&self, row: &mut Row, name: &str) {
        let hit = match self.companies.search_top(name).await {
            Ok(Some(hit)) => hit,
            Ok(None) => {
                debug!(name, "no company match");
                return;
            }
            Err(err) => {
                warn!(name, error = %err, "company search failed");
                return;
            }
        };

        row.insert(COMPANY_NUMBER_FIELD.to_string(), hit.company_number.clone());

        let profile = match self.companies.profile(&hit.company_number).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(company_number = %hit.company_number, error = %err, "company profile lookup failed");
                return;
            }
        };
        if let Some(address) = profile.registered_address {
            row.insert(REGISTERED_ADDRESS_FIELD.to_string(), address);
        }

        let officers = match self.companies.officers(&hit.company_number).await {
            Ok(officers) => officers,
            Err(err) => {
                warn!(company_number = %hit.company_number, error = %err, "officer listing failed");
                return;
            }
        };

        let directors = active_officer_names(&officers, Officer::is_director);
        let secretaries = active_officer_names(&officers, Officer::is_secretary);
        row.insert(ACTIVE_DIRECTORS_FIELD.to_string(), join_or_none(&directors));
        row.insert(
            ACTIVE_SECRETARIES_FIELD.to_string(),
            join_or_none(&secretaries),
        );
    }
}

fn active_officer_names(officers: &[Officer], kind: impl Fn(&Officer) -> bool) -> Vec<String> {
    officers
        .iter()
        .filter(|officer| officer.is_active() && kind(officer))
        .map(|officer| officer.name.clone())
        .collect()
}

/// `"None"` distinguishes an empty officer list from a failed lookup chain.
pub fn join_or_none(names: &[String]) -> String {
    if names.is_empty() {
        NONE_LISTED.to_string()
    } else {
        names.join(", ")
    }
}
