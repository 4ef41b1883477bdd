use no_call::engine::{BreakerRegistry, BreakerSettings, DecisionCache, ProviderRegistry};
use no_call::model::{AuthType, FeedFormat, ListSource, Provider, SyncType};
use no_call::store::{MemoryStore, SuppressionStore};
use no_call::sync::{
    FetchRequest, HttpFetcher, ProviderFetcher, SyncOptions, SyncSettings, SyncWorker,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Request, Response, Server};

/// What the local upstream saw for one request.
#[derive(Debug)]
struct Seen {
    url: String,
    api_key: Option<String>,
    authorization: Option<String>,
}

fn header(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str().to_string())
}

/// Serves `responses` in order, one per request, reporting each request seen.
fn spawn_server(
    responses: Vec<(u16, &'static str, Option<&'static str>)>,
) -> (String, mpsc::Receiver<Seen>, thread::JoinHandle<()>) {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    let url = format!("http://{addr}/feed");
    let (tx, rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        for (status, body, next_token) in responses {
            let Ok(request) = server.recv() else {
                return;
            };
            let _ = tx.send(Seen {
                url: request.url().to_string(),
                api_key: header(&request, "X-API-Key"),
                authorization: header(&request, "Authorization"),
            });
            let mut response = Response::from_string(body).with_status_code(status);
            if let Some(token) = next_token {
                response = response
                    .with_header(Header::from_bytes(&b"X-Next-Token"[..], token.as_bytes()).unwrap());
            }
            let _ = request.respond(response);
        }
    });

    (url, rx, handle)
}

fn provider(url: &str, format: FeedFormat) -> Provider {
    let mut p = Provider::builtin(ListSource::Custom);
    p.id = "partner".to_string();
    p.base_url = Some(url.to_string());
    p.feed_format = format;
    p.timeout_seconds = 5;
    p.rate_limit_per_min = 0;
    p.retry_attempts = 0;
    p.update_frequency_minutes = 60;
    p
}

fn request(provider: Provider, sync_type: SyncType) -> FetchRequest {
    FetchRequest {
        provider,
        sync_type,
        token: None,
        credential: None,
    }
}

#[tokio::test]
async fn test_json_feed_with_api_key() {
    let body = r#"{
        "records": [
            {"phone_number": "+14155550001", "reason": "fraud_prevention", "reference": "case-9"},
            {"phone_number": "+14155550002", "deleted": true}
        ],
        "next_token": "cursor-2",
        "complete": true
    }"#;
    let (url, seen, handle) = spawn_server(vec![(200, body, None)]);

    let mut p = provider(&url, FeedFormat::Json);
    p.auth_type = AuthType::ApiKey;
    let mut req = request(p, SyncType::Incremental);
    req.token = Some("cursor-1".to_string());
    req.credential = Some("secret-key".to_string());

    let batch = HttpFetcher::new().unwrap().fetch(&req).await.unwrap();
    handle.join().unwrap();

    assert_eq!(batch.records.len(), 2);
    assert_eq!(batch.records[0].source_reference.as_deref(), Some("case-9"));
    assert!(batch.records[1].deleted);
    assert_eq!(batch.next_token.as_deref(), Some("cursor-2"));

    let seen = seen.recv().unwrap();
    assert!(seen.url.contains("sync=incremental"));
    assert!(seen.url.contains("token=cursor-1"));
    assert_eq!(seen.api_key.as_deref(), Some("secret-key"));
}

#[tokio::test]
async fn test_lines_feed_is_streamed() {
    let body = "# partner export\n+14155550001\n\n-+14155550002\n+1 415 555 0003\n";
    let (url, seen, handle) = spawn_server(vec![(200, body, Some("t-77"))]);

    let mut p = provider(&url, FeedFormat::Lines);
    p.auth_type = AuthType::Oauth;
    let mut req = request(p, SyncType::Full);
    req.credential = Some("bearer-token".to_string());

    let batch = HttpFetcher::new().unwrap().fetch(&req).await.unwrap();
    handle.join().unwrap();

    assert_eq!(batch.records.len(), 3);
    assert!(batch.records[1].deleted);
    assert!(batch.complete);
    assert_eq!(batch.next_token.as_deref(), Some("t-77"));

    let seen = seen.recv().unwrap();
    assert!(seen.url.contains("sync=full"));
    assert_eq!(seen.authorization.as_deref(), Some("Bearer bearer-token"));
}

#[tokio::test]
async fn test_status_codes_map_to_error_kinds() {
    let (url, _seen, handle) = spawn_server(vec![
        (503, "busy", None),
        (401, "nope", None),
        (404, "missing", None),
        (200, "{not json", None),
    ]);
    let fetcher = HttpFetcher::new().unwrap();
    let req = request(provider(&url, FeedFormat::Json), SyncType::Full);

    let unavailable = fetcher.fetch(&req).await.unwrap_err();
    assert_eq!(unavailable.code(), "upstream_unavailable");
    assert!(unavailable.is_transient());

    assert_eq!(
        fetcher.fetch(&req).await.unwrap_err().code(),
        "policy_violation"
    );
    let not_found = fetcher.fetch(&req).await.unwrap_err();
    assert_eq!(not_found.code(), "validation_error");
    assert!(!not_found.is_transient());
    assert_eq!(
        fetcher.fetch(&req).await.unwrap_err().code(),
        "validation_error"
    );
    handle.join().unwrap();
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    // Bind and drop to get a port nobody listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let url = format!("http://127.0.0.1:{port}/feed");
    let req = request(provider(&url, FeedFormat::Json), SyncType::Full);
    let err = HttpFetcher::new().unwrap().fetch(&req).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_worker_pages_through_http_feed() {
    let page1 = r#"{"records": [{"phone_number": "+14155550001"}], "next_token": "p2", "complete": false}"#;
    let page2 = r#"{"records": [{"phone_number": "+14155550002"}], "next_token": "resume-1", "complete": true}"#;
    let (url, seen, handle) = spawn_server(vec![(200, page1, None), (200, page2, None)]);

    let mut p = provider(&url, FeedFormat::Json);
    p.auth_type = AuthType::Basic;
    p.credential_env = Some("NO_CALL_HTTP_TEST_BASIC".to_string());
    p.sync_type = Some(SyncType::Incremental);
    std::env::set_var("NO_CALL_HTTP_TEST_BASIC", "user:pass");

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(ProviderRegistry::new(vec![p]));
    let worker = SyncWorker::new(
        store.clone(),
        registry.clone(),
        Arc::new(BreakerRegistry::new(BreakerSettings::default())),
        Arc::new(DecisionCache::new(true, 100, Duration::from_secs(60))),
        Arc::new(HttpFetcher::new().unwrap()),
        SyncSettings::default(),
    );

    let report = worker.sync("partner", SyncOptions::default()).await.unwrap();
    handle.join().unwrap();

    assert_eq!(report.fetched, 2);
    assert_eq!(report.added, 2);
    assert_eq!(report.sync_token.as_deref(), Some("resume-1"));
    assert_eq!(store.provider_entries("partner").await.unwrap().len(), 2);
    assert_eq!(
        registry.get("partner").unwrap().sync_token.as_deref(),
        Some("resume-1")
    );

    let first = seen.recv().unwrap();
    let second = seen.recv().unwrap();
    assert!(!first.url.contains("token="));
    assert!(second.url.contains("token=p2"));
    // base64("user:pass")
    assert_eq!(first.authorization.as_deref(), Some("Basic dXNlcjpwYXNz"));
}
