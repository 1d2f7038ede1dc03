//! Explode enriched director names into one record per provider/director pair.

use std::collections::HashSet;

use cpls_core::{PROVIDER_ID_FIELD, PROVIDER_NAME_FIELD};
use cpls_enrich::{ACTIVE_DIRECTORS_FIELD, NONE_LISTED, NOT_FOUND};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::{json_field_str, RecordStore, StoreError, BATCH_SIZE, LEADS_TABLE};

pub const DIRECTOR_ENRICHMENT_TABLE: &str = "Director Enrichment";

pub const DIRECTOR_NAME_FIELD: &str = "Director Name";
pub const DIRECTOR_KEY_FIELD: &str = "Director Key";
pub const ENRICHMENT_STATUS_FIELD: &str = "Enrichment Status";
const PENDING_STATUS: &str = "pending";

/// Normalise a director name for use in the director key: lowercase, strip
/// punctuation, collapse whitespace.
pub fn normalise_name(name: &str) -> String {
    let stripped: String = name
        .trim()
        .to_lowercase()
        .chars()
        .filter(|ch| {
            !matches!(
                ch,
                '.' | ',' | '\'' | '"' | '-' | '(' | ')' | '[' | ']' | '{' | '}'
            )
        })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split a raw directors string into unique names. Commas, semicolons, line
/// breaks, and " and " all separate names; de-duplication is
/// case-insensitive and keeps the first spelling seen.
pub fn parse_director_names(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }

    let text = raw
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace(" and ", ",");

    let mut seen: HashSet<String> = HashSet::new();
    let mut names = Vec::new();
    for part in text.split(|ch| matches!(ch, ',' | ';' | '\n')) {
        let name = part.trim();
        if name.is_empty() {
            continue;
        }
        if !seen.insert(name.to_lowercase()) {
            continue;
        }
        names.push(name.to_string());
    }
    names
}

/// Deterministic key for a provider/director pair; `None` when the name
/// normalises away to nothing.
pub fn build_director_key(provider_id: &str, director_name: &str) -> Option<String> {
    let normalised = normalise_name(director_name);
    if normalised.is_empty() {
        return None;
    }
    Some(format!("{provider_id}::{normalised}"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirectorExplodeOutcome {
    pub leads_processed: usize,
    pub leads_skipped_no_provider_id: usize,
    pub names_parsed: usize,
    pub created: usize,
    pub skipped_existing: usize,
}

/// Read director names off the Leads table and create one pending enrichment
/// record per provider/director pair not already present.
pub async fn run_director_explode(
    store: &dyn RecordStore,
) -> Result<DirectorExplodeOutcome, StoreError> {
    info!("fetching existing director keys for de-duplication");
    let existing = store
        .list_records(DIRECTOR_ENRICHMENT_TABLE, &[DIRECTOR_KEY_FIELD])
        .await?;
    let mut existing_keys: HashSet<String> = HashSet::new();
    for record in existing {
        if let Some(key) = json_field_str(&record.fields, &[DIRECTOR_KEY_FIELD]) {
            existing_keys.insert(key.to_string());
        }
    }
    info!(existing = existing_keys.len(), "found existing director keys");

    let leads = store
        .list_records(
            LEADS_TABLE,
            &[PROVIDER_ID_FIELD, PROVIDER_NAME_FIELD, ACTIVE_DIRECTORS_FIELD],
        )
        .await?;

    let mut outcome = DirectorExplodeOutcome::default();
    let mut queued_keys: HashSet<String> = HashSet::new();
    let mut records_to_create: Vec<Map<String, Value>> = Vec::new();

    for lead in &leads {
        outcome.leads_processed += 1;

        let Some(provider_id) = json_field_str(&lead.fields, &[PROVIDER_ID_FIELD]) else {
            outcome.leads_skipped_no_provider_id += 1;
            continue;
        };
        let provider_name = json_field_str(&lead.fields, &[PROVIDER_NAME_FIELD]).unwrap_or("");

        let Some(directors_raw) = json_field_str(&lead.fields, &[ACTIVE_DIRECTORS_FIELD]) else {
            continue;
        };
        // Placeholder values mean enrichment never produced names here.
        if directors_raw == NOT_FOUND || directors_raw == NONE_LISTED {
            continue;
        }

        let names = parse_director_names(directors_raw);
        outcome.names_parsed += names.len();

        for name in names {
            let Some(key) = build_director_key(provider_id, &name) else {
                continue;
            };
            if existing_keys.contains(&key) || queued_keys.contains(&key) {
                outcome.skipped_existing += 1;
                continue;
            }
            queued_keys.insert(key.clone());

            let mut fields = Map::new();
            fields.insert(
                PROVIDER_NAME_FIELD.to_string(),
                Value::String(provider_name.to_string()),
            );
            fields.insert(
                PROVIDER_ID_FIELD.to_string(),
                Value::String(provider_id.to_string()),
            );
            fields.insert(DIRECTOR_NAME_FIELD.to_string(), Value::String(name));
            fields.insert(DIRECTOR_KEY_FIELD.to_string(), Value::String(key));
            fields.insert(
                ENRICHMENT_STATUS_FIELD.to_string(),
                Value::String(PENDING_STATUS.to_string()),
            );
            records_to_create.push(fields);
        }
    }

    info!(
        leads = outcome.leads_processed,
        candidates = records_to_create.len(),
        skipped_existing = outcome.skipped_existing,
        "director explode partitioned"
    );

    for batch in records_to_create.chunks(BATCH_SIZE) {
        outcome.created += store.create_batch(DIRECTOR_ENRICHMENT_TABLE, batch).await?;
    }

    info!(created = outcome.created, "director explode finished");
    Ok(outcome)
}
