//! End-to-end reconcile scenarios over a scripted in-memory transport and a
//! stubbed authority server.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::{NaiveDate, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use busca_fiscal::authority::TaxAuthorityClient;
use busca_fiscal::config::{
    AuthorityConfig, Config, LocalConfig, MatcherConfig, RemoteConfig, SearchConfig,
};
use busca_fiscal::index::RemoteDocumentIndex;
use busca_fiscal::models::{ArtifactKind, MatchMode, SearchQuery};
use busca_fiscal::reconcile::{run_reconcile, ReconcileOptions, ReconcileOutcome};
use busca_fiscal::session::{
    Credentials, ReconnectPolicy, RemoteEntry, RemoteSession, RemoteTransport, SessionError,
};

const PREFIX: &str = "DPS4205407247791668000249009";
const DPS_ID_29: &str = "DPS420540724779166800024900900000000000000029";

/// In-memory remote store. `flaky_lists` makes the next N directory listings
/// fail at the transport level, exercising the reconnect path mid-search.
struct MemoryTransport {
    dirs: HashMap<String, Vec<RemoteEntry>>,
    flaky_lists: Arc<AtomicU32>,
}

impl MemoryTransport {
    fn new(dirs: HashMap<String, Vec<RemoteEntry>>) -> Self {
        Self {
            dirs,
            flaky_lists: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl RemoteTransport for MemoryTransport {
    fn connect(&mut self, _credentials: &Credentials) -> Result<(), SessionError> {
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn probe(&mut self) -> bool {
        true
    }

    fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>, SessionError> {
        if self.flaky_lists.load(Ordering::SeqCst) > 0 {
            self.flaky_lists.fetch_sub(1, Ordering::SeqCst);
            return Err(SessionError::Network("connection reset".into()));
        }
        self.dirs
            .get(path)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(path.to_string()))
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, SessionError> {
        Err(SessionError::NotFound(path.to_string()))
    }
}

fn file(dir: &str, name: &str, mtime: i64) -> RemoteEntry {
    RemoteEntry {
        path: format!("{}/{}", dir, name),
        name: name.to_string(),
        size: 2048,
        modified_at: Utc.timestamp_opt(mtime, 0).unwrap(),
        is_dir: false,
    }
}

fn subdir(dir: &str, name: &str) -> RemoteEntry {
    RemoteEntry {
        path: format!("{}/{}", dir, name),
        name: name.to_string(),
        size: 0,
        modified_at: Utc.timestamp_opt(0, 0).unwrap(),
        is_dir: true,
    }
}

fn test_config(authority: Option<AuthorityConfig>) -> Config {
    Config {
        remote: RemoteConfig {
            host: "files.test".into(),
            port: 22,
            user: "svc".into(),
            password: Some("pw".into()),
            private_key: None,
            slip_root: "/slips".into(),
            invoice_root: Some("/invoices".into()),
        },
        search: SearchConfig::default(),
        authority,
        certificate: None,
        local: LocalConfig::default(),
        matcher: MatcherConfig::default(),
    }
}

fn authority_config(server: &MockServer) -> AuthorityConfig {
    AuthorityConfig {
        dps_url: format!("{}/dps", server.uri()),
        nfse_url: format!("{}/nfse", server.uri()),
        danfse_url: format!("{}/danfse", server.uri()),
        dps_prefix: PREFIX.to_string(),
    }
}

fn gzip_b64(text: &str) -> String {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    base64::engine::general_purpose::STANDARD.encode(encoder.finish().unwrap())
}

fn number_query(number: &str) -> SearchQuery {
    SearchQuery {
        number: Some(number.to_string()),
        since: None,
        until: None,
        recursive: true,
        mode: MatchMode::Substring,
    }
}

async fn reconcile(
    cfg: &Config,
    transport: MemoryTransport,
    query: SearchQuery,
    cancel: CancellationToken,
) -> ReconcileOutcome {
    let session = Arc::new(RemoteSession::new(
        Box::new(transport),
        Credentials {
            user: "svc".into(),
            password: Some("pw".into()),
            private_key: None,
        },
        ReconnectPolicy {
            max_attempts: 2,
            delay: Duration::ZERO,
        },
    ));
    let index = Arc::new(RemoteDocumentIndex::new(Arc::clone(&session), cfg).unwrap());
    let authority = cfg.authority.as_ref().map(|a| {
        Arc::new(TaxAuthorityClient::new(a, None, Duration::from_secs(5)).unwrap())
    });

    run_reconcile(
        session,
        index,
        authority,
        query,
        ReconcileOptions {
            lookup_workers: cfg.search.lookup_workers,
            extract_names: false,
            prefer_authority: cfg.matcher.prefer_authority,
        },
        cancel,
    )
    .await
    .unwrap()
}

fn store_with_slip_29() -> HashMap<String, Vec<RemoteEntry>> {
    let mut dirs = HashMap::new();
    dirs.insert("/slips".to_string(), vec![file("/slips", "slip_0029.pdf", 1_000)]);
    dirs.insert("/invoices".to_string(), Vec::new());
    dirs
}

#[tokio::test]
async fn query_29_yields_one_reconciled_group() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/dps/{}", DPS_ID_29)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "chaveAcesso": "K1" })))
        .mount(&server)
        .await;
    let xml = "<NFSe><toma><xNome>ACME LTDA</xNome></toma>\
               <infDPS><dhEmi>2024-05-01</dhEmi></infDPS></NFSe>";
    Mock::given(method("GET"))
        .and(path("/nfse/K1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "nfseXmlGZipB64": gzip_b64(xml) })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/danfse/K1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7".to_vec()))
        .mount(&server)
        .await;

    let cfg = test_config(Some(authority_config(&server)));
    let transport = MemoryTransport::new(store_with_slip_29());

    let outcome = reconcile(&cfg, transport, number_query("29"), CancellationToken::new()).await;

    assert!(!outcome.cancelled);
    assert!(outcome.lookup_failures.is_empty());
    assert_eq!(outcome.groups.len(), 1);
    let group = &outcome.groups[0];
    assert_eq!(group.number, "29");
    assert_eq!(group.slip.as_ref().unwrap().name, "slip_0029.pdf");
    assert!(group.invoice.is_none());
    assert!(group.tax_xml.as_deref().unwrap().contains("ACME LTDA"));
    assert!(group.tax_pdf.is_some());
    assert_eq!(group.customer_name.as_deref(), Some("ACME LTDA"));
    assert_eq!(group.issue_date.as_deref(), Some("2024-05-01"));
}

#[tokio::test]
async fn distinct_numbers_stay_in_distinct_groups() {
    let mut dirs = HashMap::new();
    dirs.insert(
        "/slips".to_string(),
        vec![
            file("/slips", "slip_0029.pdf", 2_000),
            file("/slips", "slip_0031.pdf", 1_000),
        ],
    );
    dirs.insert(
        "/invoices".to_string(),
        vec![file("/invoices", "nf_0031.pdf", 1_500)],
    );

    let cfg = test_config(None);
    let query = SearchQuery {
        number: None,
        since: Some(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
        until: Some(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()),
        recursive: true,
        mode: MatchMode::Substring,
    };
    let outcome = reconcile(
        &cfg,
        MemoryTransport::new(dirs),
        query,
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome.artifacts_found, 3);
    assert_eq!(outcome.groups.len(), 2);
    let by_number: HashMap<&str, _> = outcome
        .groups
        .iter()
        .map(|g| (g.number.as_str(), g))
        .collect();
    assert!(by_number["29"].slip.is_some());
    assert!(by_number["29"].invoice.is_none());
    assert!(by_number["31"].slip.is_some());
    assert!(by_number["31"].invoice.is_some());
}

#[tokio::test]
async fn traversal_descends_into_branch_subdirectories() {
    let mut dirs = HashMap::new();
    dirs.insert(
        "/slips".to_string(),
        vec![subdir("/slips", "branch01"), subdir("/slips", "branch02")],
    );
    dirs.insert(
        "/slips/branch01".to_string(),
        vec![file("/slips/branch01", "slip_0029.pdf", 1_000)],
    );
    dirs.insert(
        "/slips/branch02".to_string(),
        vec![file("/slips/branch02", "nota_0029.txt", 1_000)], // filtered by extension
    );
    dirs.insert("/invoices".to_string(), Vec::new());

    let cfg = test_config(None);
    let outcome = reconcile(
        &cfg,
        MemoryTransport::new(dirs),
        number_query("29"),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome.artifacts_found, 1);
    assert_eq!(
        outcome.groups[0].slip.as_ref().unwrap().path,
        "/slips/branch01/slip_0029.pdf"
    );
    assert_eq!(outcome.groups[0].slip.as_ref().unwrap().kind, ArtifactKind::Slip);
}

#[tokio::test]
async fn mid_listing_disconnect_is_recovered() {
    let transport = MemoryTransport::new(store_with_slip_29());
    // Fail the first listing attempt at the transport level; the session
    // must reconnect and retry without the search noticing.
    transport.flaky_lists.store(1, Ordering::SeqCst);

    let cfg = test_config(None);
    let outcome = reconcile(&cfg, transport, number_query("29"), CancellationToken::new()).await;

    assert_eq!(outcome.groups.len(), 1);
    assert_eq!(outcome.groups[0].number, "29");
}

#[tokio::test]
async fn failed_lookup_keeps_the_group_with_empty_tax_slots() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/dps/{}", DPS_ID_29)))
        .respond_with(ResponseTemplate::new(500).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let cfg = test_config(Some(authority_config(&server)));
    let outcome = reconcile(
        &cfg,
        MemoryTransport::new(store_with_slip_29()),
        number_query("29"),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome.groups.len(), 1);
    let group = &outcome.groups[0];
    assert!(group.slip.is_some());
    assert!(group.tax_xml.is_none());
    assert!(group.tax_pdf.is_none());
    assert_eq!(outcome.lookup_failures.len(), 1);
    assert_eq!(outcome.lookup_failures[0].0, "29");
}

#[tokio::test]
async fn document_without_authority_record_still_groups() {
    // Stub with no mocks: access-key resolution 404s, which is a valid
    // empty result: no failure recorded, group stays.
    let server = MockServer::start().await;
    let cfg = test_config(Some(authority_config(&server)));

    let outcome = reconcile(
        &cfg,
        MemoryTransport::new(store_with_slip_29()),
        number_query("29"),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome.groups.len(), 1);
    assert!(outcome.lookup_failures.is_empty());
    assert!(outcome.groups[0].tax_xml.is_none());
}

#[tokio::test]
async fn cancelled_search_discards_lookup_results() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/dps/{}", DPS_ID_29)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "chaveAcesso": "K1" })))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let cfg = test_config(Some(authority_config(&server)));
    let outcome = reconcile(
        &cfg,
        MemoryTransport::new(store_with_slip_29()),
        number_query("29"),
        cancel,
    )
    .await;

    assert!(outcome.cancelled);
    assert_eq!(outcome.groups.len(), 1);
    // nothing merged after cancellation
    assert!(outcome.groups[0].tax_xml.is_none());
}

#[tokio::test]
async fn date_only_search_sorts_newest_first() {
    let mut dirs = HashMap::new();
    dirs.insert(
        "/slips".to_string(),
        vec![
            file("/slips", "slip_0029.pdf", 1_000),
            file("/slips", "slip_0031.pdf", 5_000),
        ],
    );
    dirs.insert("/invoices".to_string(), Vec::new());

    let cfg = test_config(None);
    let query = SearchQuery {
        number: None,
        since: Some(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
        until: Some(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()),
        recursive: true,
        mode: MatchMode::Substring,
    };
    let outcome = reconcile(
        &cfg,
        MemoryTransport::new(dirs),
        query,
        CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome.groups.len(), 2);
    assert_eq!(outcome.groups[0].number, "31");
    assert_eq!(outcome.groups[1].number, "29");
}
