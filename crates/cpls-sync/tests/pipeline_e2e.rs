//! Full-run behavior: download, parse, enrich, and reconcile against mocks.

use std::path::PathBuf;
use std::time::Duration;

use cpls_adapters::SourceSpec;
use cpls_core::RunStatus;
use cpls_enrich::EnrichmentConfig;
use cpls_sync::{JobPipeline, SyncConfig};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const EXPORT_BODY: &str = "\
\"CQC Location ID (for office use only)\",Name,\"CQC Provider ID\",\"Provider Name\"\n\
1-AAA,Alpha Care Office,P-1,Alpha Care Ltd\n\
1-BBB,Beta Care Office,P-1,Beta Care Ltd\n";

const EMPTY_EXPORT_BODY: &str =
    "\"CQC Location ID (for office use only)\",Name,\"CQC Provider ID\",\"Provider Name\"\n";

fn test_config(server: &MockServer, data_dir: PathBuf) -> SyncConfig {
    SyncConfig {
        data_dir,
        run_token: "test-token".to_string(),
        port: 0,
        user_agent: "cpls-test/0.1".to_string(),
        http_timeout_secs: 5,
        airtable_base_url: server.uri(),
        airtable_base_id: "appTEST".to_string(),
        airtable_token: "at-test-token".to_string(),
        cqc_api_base_url: server.uri(),
        companies_house_base_url: server.uri(),
        companies_house_api_key: "ch-test-key".to_string(),
        enrichment: EnrichmentConfig {
            site_threshold: 7,
            inter_row_delay: Duration::ZERO,
        },
        scheduler_enabled: false,
        sync_cron: "0 6 * * *".to_string(),
    }
}

fn test_sources(server: &MockServer) -> Vec<SourceSpec> {
    vec![
        SourceSpec::new(
            "homecare",
            "homecare",
            &format!("{}/export/homecare.csv", server.uri()),
        ),
        SourceSpec::new(
            "carehomes",
            "carehomes",
            &format!("{}/export/carehomes.csv", server.uri()),
        ),
    ]
}

async fn mount_exports(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/export/homecare.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(EXPORT_BODY, "text/csv"))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/export/carehomes.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(EMPTY_EXPORT_BODY, "text/csv"))
        .mount(server)
        .await;
}

async fn mount_registries(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/providers/P-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "providerId": "P-1",
            "locationIds": ["1-AAA", "1-BBB"]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search/companies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": []})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn empty_remote_store_creates_every_parsed_row() {
    let server = MockServer::start().await;
    mount_exports(&server).await;
    mount_registries(&server).await;

    Mock::given(method("GET"))
        .and(path("/v0/appTEST/Leads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"records": []})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v0/appTEST/Leads"))
        .and(body_string_contains("1-AAA"))
        .and(body_string_contains("1-BBB"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "records": [{"id": "rec1"}, {"id": "rec2"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("tempdir");
    let pipeline = JobPipeline::new(test_config(&server, dir.path().to_path_buf()))
        .expect("pipeline")
        .with_sources(test_sources(&server));

    let summary = pipeline.run_once().await.expect("run");

    assert_eq!(summary.status, RunStatus::Ok);
    assert_eq!(summary.rows_parsed, 2);
    assert_eq!(summary.enrichment.kept, 2);
    assert_eq!(summary.reconcile.created, 2);
    assert_eq!(summary.reconcile.updated, 0);
    assert!(summary.sources.iter().all(|report| report.ok));
}

#[tokio::test]
async fn known_location_updates_instead_of_creating() {
    let server = MockServer::start().await;
    mount_exports(&server).await;
    mount_registries(&server).await;

    Mock::given(method("GET"))
        .and(path("/v0/appTEST/Leads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "records": [{
                "id": "recEXIST",
                "fields": {"CQC Location ID (for office use only)": "1-AAA"}
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v0/appTEST/Leads"))
        .and(body_string_contains("1-BBB"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "records": [{"id": "recNEW"}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/v0/appTEST/Leads"))
        .and(body_string_contains("recEXIST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "records": [{"id": "recEXIST"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("tempdir");
    let pipeline = JobPipeline::new(test_config(&server, dir.path().to_path_buf()))
        .expect("pipeline")
        .with_sources(test_sources(&server));

    let summary = pipeline.run_once().await.expect("run");

    assert_eq!(summary.status, RunStatus::Ok);
    assert_eq!(summary.reconcile.created, 1);
    assert_eq!(summary.reconcile.updated, 1);
}

#[tokio::test]
async fn failed_source_download_blocks_the_sync_phase() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/export/homecare.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(EXPORT_BODY, "text/csv"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/export/carehomes.csv"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("<html><body>service unavailable,\n</body></html>", "text/html"),
        )
        .mount(&server)
        .await;
    // The sync phase must never run: any Leads traffic fails the test.
    Mock::given(method("GET"))
        .and(path_regex(r"^/v0/.*$"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("tempdir");
    let pipeline = JobPipeline::new(test_config(&server, dir.path().to_path_buf()))
        .expect("pipeline")
        .with_sources(test_sources(&server));

    let summary = pipeline.run_once().await.expect("run");

    assert_eq!(summary.status, RunStatus::Error);
    assert_eq!(summary.rows_parsed, 0);
    assert!(summary.error.is_some());
    let flags: Vec<bool> = summary.sources.iter().map(|report| report.ok).collect();
    assert_eq!(flags, vec![true, false]);
}
