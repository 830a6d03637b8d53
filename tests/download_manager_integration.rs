//! Integration tests for the download manager.
//!
//! These tests run `DownloadManager` against a mock HTTP server with a real
//! archive ledger on disk, covering dedup, pacing, retry, cancellation and
//! ledger failure behavior.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use galleryfetch_core::auth::StaticHeaders;
use galleryfetch_core::download::PARTIAL_SUFFIX;
use galleryfetch_core::{
    ArchiveLedger, ChannelSink, DownloadManager, DownloadSummary, DownloadTask, EngineError,
    HttpClient, LedgerWriter, MetadataValue, ProgressKind, RateLimiter, RetryPolicy, SourceError,
    VecTaskSource,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, Respond, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return Ok(());
        };
        mock_server
    }};
}

type TestResult = Result<(), Box<dyn std::error::Error>>;

// ==================== Helper Functions ====================

/// Retry policy with millisecond backoff so retry tests stay fast.
fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_retries,
        Duration::from_millis(10),
        Duration::from_millis(50),
        2.0,
    )
}

fn client() -> HttpClient {
    HttpClient::new(Duration::from_secs(10)).unwrap()
}

fn manager(concurrency: usize, policy: RetryPolicy) -> DownloadManager {
    DownloadManager::new(
        concurrency,
        policy,
        Arc::new(RateLimiter::disabled()),
        client(),
    )
    .unwrap()
}

async fn open_ledger(dir: &Path) -> Arc<ArchiveLedger> {
    let path = ArchiveLedger::path_for_output_dir(dir);
    Arc::new(ArchiveLedger::load(&path).await.unwrap())
}

/// Runs `tasks` with a fresh writer over `ledger` and shuts the writer down.
async fn run_tasks(
    manager: &DownloadManager,
    ledger: &Arc<ArchiveLedger>,
    tasks: Vec<DownloadTask>,
) -> Result<DownloadSummary, EngineError> {
    let writer = LedgerWriter::spawn(Arc::clone(ledger));
    let result = manager
        .run(
            Box::new(VecTaskSource::new(tasks)),
            writer.handle(),
            CancellationToken::new(),
        )
        .await;
    writer.shutdown().await;
    result
}

fn task(server_uri: &str, name: &str, dir: &Path) -> DownloadTask {
    DownloadTask::new(format!("{server_uri}/{name}"), dir.join("gallery").join(name))
}

/// Temp files left next to `destination`.
fn leftover_partials(destination: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(destination.parent().unwrap()) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.to_string_lossy().ends_with(PARTIAL_SUFFIX))
        .collect()
}

/// Responds with `status` for the first `fail_count` requests, then 200.
struct FailThenSucceed {
    hits: Arc<AtomicUsize>,
    fail_count: usize,
    status: u16,
}

impl Respond for FailThenSucceed {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        let n = self.hits.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_count {
            ResponseTemplate::new(self.status)
        } else {
            ResponseTemplate::new(200).set_body_bytes(b"image-bytes".to_vec())
        }
    }
}

/// Records when each request arrives.
struct ArrivalRecorder {
    arrivals: Arc<Mutex<Vec<Instant>>>,
}

impl Respond for ArrivalRecorder {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        self.arrivals.lock().unwrap().push(Instant::now());
        ResponseTemplate::new(200).set_body_bytes(b"img".to_vec())
    }
}

// ==================== Basic Download Tests ====================

#[tokio::test]
async fn test_run_empty_source_returns_zero_summary() -> TestResult {
    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;

    let summary = run_tasks(&manager(2, fast_policy(3)), &ledger, Vec::new()).await?;

    assert_eq!(summary.total(), 0);
    assert_eq!(summary.retries, 0);
    assert!(!summary.was_cancelled);
    Ok(())
}

#[tokio::test]
async fn test_single_download_writes_file_and_records_url() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/001.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg-data".to_vec()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let task = task(&mock_server.uri(), "001.jpg", dir.path())
        .with_metadata("gallery", "Night City")
        .with_metadata("index", 1_i64);
    let destination = task.destination.clone();
    let url = task.url.clone();

    let summary = run_tasks(&manager(2, fast_policy(3)), &ledger, vec![task]).await?;

    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.bytes, 9);
    assert_eq!(std::fs::read(&destination)?, b"jpeg-data");
    assert!(leftover_partials(&destination).is_empty());

    let record = ledger.get(&url).expect("url should be recorded");
    assert_eq!(
        record.metadata.get("gallery"),
        Some(&MetadataValue::from("Night City"))
    );

    // The flushed archive on disk holds the same entry
    let reloaded = ArchiveLedger::load(ledger.path()).await?;
    assert!(reloaded.contains(&url));
    Ok(())
}

// ==================== Dedup Tests ====================

#[tokio::test]
async fn test_second_run_downloads_nothing() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .expect(3)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let tasks: Vec<_> = ["1.jpg", "2.jpg", "3.jpg"]
        .iter()
        .map(|name| task(&mock_server.uri(), name, dir.path()))
        .collect();

    let ledger = open_ledger(dir.path()).await;
    let first = run_tasks(&manager(2, fast_policy(3)), &ledger, tasks.clone()).await?;
    assert_eq!(first.downloaded, 3);

    // Fresh process: ledger reloaded from disk
    let ledger = open_ledger(dir.path()).await;
    let second = run_tasks(&manager(2, fast_policy(3)), &ledger, tasks).await?;
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(second.failed, 0);
    Ok(())
}

#[tokio::test]
async fn test_archived_url_is_never_fetched() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .expect(0)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let task = task(&mock_server.uri(), "old.jpg", dir.path());
    ledger.record(&task.url, Default::default());

    let summary = run_tasks(&manager(1, fast_policy(3)), &ledger, vec![task.clone()]).await?;

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.downloaded, 0);
    assert!(!task.destination.exists());
    Ok(())
}

#[tokio::test]
async fn test_force_redownload_fetches_archived_url() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let task = task(&mock_server.uri(), "old.jpg", dir.path());
    ledger.record(&task.url, Default::default());
    let before = ledger.get(&task.url).unwrap().downloaded_at;

    let manager = manager(1, fast_policy(3)).with_force_redownload(true);
    let summary = run_tasks(&manager, &ledger, vec![task.clone()]).await?;

    assert_eq!(summary.downloaded, 1);
    assert_eq!(std::fs::read(&task.destination)?, b"fresh");
    assert!(ledger.get(&task.url).unwrap().downloaded_at >= before);
    assert_eq!(ledger.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_url_in_one_run_downloads_once() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let first = task(&mock_server.uri(), "same.jpg", dir.path());
    let second = first.clone();

    let summary = run_tasks(&manager(1, fast_policy(3)), &ledger, vec![first, second]).await?;

    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.skipped, 1);
    Ok(())
}

// ==================== Rate Limiting Tests ====================

#[tokio::test]
async fn test_five_tasks_two_workers_respect_min_interval() -> TestResult {
    let mock_server = require_mock_server!();
    let arrivals = Arc::new(Mutex::new(Vec::new()));
    Mock::given(method("GET"))
        .respond_with(ArrivalRecorder {
            arrivals: Arc::clone(&arrivals),
        })
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let tasks: Vec<_> = (1..=5)
        .map(|i| task(&mock_server.uri(), &format!("{i}.jpg"), dir.path()))
        .collect();

    let manager = DownloadManager::new(
        2,
        fast_policy(3),
        Arc::new(RateLimiter::new(Duration::from_millis(100))),
        client(),
    )?;

    let started = Instant::now();
    let summary = run_tasks(&manager, &ledger, tasks).await?;
    let elapsed = started.elapsed();

    assert_eq!(summary.downloaded, 5);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.failed, 0);
    assert!(
        elapsed >= Duration::from_millis(400),
        "5 paced starts need at least 4 intervals, took {elapsed:?}"
    );

    let mut arrivals = arrivals.lock().unwrap().clone();
    arrivals.sort();
    for pair in arrivals.windows(2) {
        let gap = pair[1] - pair[0];
        // Small slack for scheduling between grant and server receipt
        assert!(gap >= Duration::from_millis(80), "requests {gap:?} apart");
    }
    Ok(())
}

// ==================== Retry Tests ====================

#[tokio::test]
async fn test_429_then_success_downloads_once_with_k_retries() -> TestResult {
    let mock_server = require_mock_server!();
    let hits = Arc::new(AtomicUsize::new(0));
    Mock::given(method("GET"))
        .respond_with(FailThenSucceed {
            hits: Arc::clone(&hits),
            fail_count: 2,
            status: 429,
        })
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let task = task(&mock_server.uri(), "busy.jpg", dir.path());

    let summary = run_tasks(&manager(1, fast_policy(3)), &ledger, vec![task.clone()]).await?;

    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.retries, 2);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(ledger.contains(&task.url));
    Ok(())
}

#[tokio::test]
async fn test_429_retry_after_header_is_honored() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;

    let started = Instant::now();
    let summary = run_tasks(
        &manager(1, fast_policy(3)),
        &ledger,
        vec![task(&mock_server.uri(), "slow.jpg", dir.path())],
    )
    .await?;

    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.retries, 1);
    assert!(started.elapsed() >= Duration::from_secs(1));
    Ok(())
}

#[tokio::test]
async fn test_retries_exhausted_marks_task_failed() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let task = task(&mock_server.uri(), "down.jpg", dir.path());

    let summary = run_tasks(&manager(1, fast_policy(2)), &ledger, vec![task.clone()]).await?;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.downloaded, 0);
    assert_eq!(summary.retries, 2);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].url, task.url);
    assert_eq!(summary.failures[0].attempts, 3);
    assert!(summary.failures[0].reason.contains("retries exhausted"));
    assert!(!ledger.contains(&task.url));
    assert!(!task.destination.exists());
    assert!(leftover_partials(&task.destination).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_404_is_permanent_and_not_retried() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;

    let summary = run_tasks(
        &manager(1, fast_policy(5)),
        &ledger,
        vec![task(&mock_server.uri(), "gone.jpg", dir.path())],
    )
    .await?;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.retries, 0);
    assert!(summary.failures[0].reason.contains("404"));
    Ok(())
}

#[tokio::test]
async fn test_one_failure_does_not_affect_others() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/bad.jpg"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"good".to_vec()))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let tasks = vec![
        task(&mock_server.uri(), "a.jpg", dir.path()),
        task(&mock_server.uri(), "bad.jpg", dir.path()),
        task(&mock_server.uri(), "b.jpg", dir.path()),
    ];

    let summary = run_tasks(&manager(2, fast_policy(1)), &ledger, tasks).await?;

    assert_eq!(summary.downloaded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(ledger.len(), 2);
    Ok(())
}

// ==================== Atomic Write Tests ====================

#[tokio::test]
async fn test_existing_unrecorded_file_is_overwritten() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"complete".to_vec()))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let task = task(&mock_server.uri(), "crash.jpg", dir.path());

    // Left behind by a run that died between fetch and record
    std::fs::create_dir_all(task.destination.parent().unwrap())?;
    std::fs::write(&task.destination, b"stale")?;

    let summary = run_tasks(&manager(1, fast_policy(0)), &ledger, vec![task.clone()]).await?;

    assert_eq!(summary.downloaded, 1);
    assert_eq!(std::fs::read(&task.destination)?, b"complete");
    assert!(leftover_partials(&task.destination).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_two_urls_sharing_a_destination_both_succeed() -> TestResult {
    let mock_server = require_mock_server!();
    let body_a = vec![b'A'; 2 * 1024 * 1024];
    let body_b = vec![b'B'; 2 * 1024 * 1024];
    Mock::given(method("GET"))
        .and(path("/a/1.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body_a.clone())
                .set_delay(Duration::from_millis(100)),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b/1.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body_b.clone())
                .set_delay(Duration::from_millis(100)),
        )
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    // Two galleries whose titles sanitize to the same directory
    let destination = dir.path().join("Same Title").join("1.jpg");
    let tasks = vec![
        DownloadTask::new(format!("{}/a/1.jpg", mock_server.uri()), destination.clone()),
        DownloadTask::new(format!("{}/b/1.jpg", mock_server.uri()), destination.clone()),
    ];
    let urls: Vec<String> = tasks.iter().map(|task| task.url.clone()).collect();

    let summary = run_tasks(&manager(2, fast_policy(0)), &ledger, tasks).await?;

    assert_eq!(summary.downloaded, 2, "failures: {:?}", summary.failures);
    assert_eq!(summary.failed, 0);
    let written = std::fs::read(&destination)?;
    assert!(
        written == body_a || written == body_b,
        "destination must hold exactly one complete body"
    );
    assert!(urls.iter().all(|url| ledger.contains(url)));
    assert!(leftover_partials(&destination).is_empty());
    Ok(())
}

// ==================== Cancellation Tests ====================

#[tokio::test]
async fn test_cancel_before_start_fetches_nothing() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
        .expect(0)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let writer = LedgerWriter::spawn(Arc::clone(&ledger));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = manager(2, fast_policy(3))
        .run(
            Box::new(VecTaskSource::new(vec![task(&mock_server.uri(), "1.jpg", dir.path())])),
            writer.handle(),
            cancel,
        )
        .await?;
    writer.shutdown().await;

    assert!(summary.was_cancelled);
    assert_eq!(summary.downloaded, 0);
    assert!(ledger.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cancel_aborts_slow_fetch_after_grace_period() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"late".to_vec())
                .set_delay(Duration::from_secs(8)),
        )
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let writer = LedgerWriter::spawn(Arc::clone(&ledger));
    let task = task(&mock_server.uri(), "slow.jpg", dir.path());
    let destination = task.destination.clone();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let manager = manager(1, fast_policy(3)).with_grace_period(Duration::from_millis(100));
    let started = Instant::now();
    let summary = manager
        .run(
            Box::new(VecTaskSource::new(vec![task])),
            writer.handle(),
            cancel,
        )
        .await?;
    writer.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(summary.was_cancelled);
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.downloaded, 0);
    assert_eq!(summary.failed, 0);
    assert!(!destination.exists());
    assert!(leftover_partials(&destination).is_empty());
    assert!(ledger.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cancel_interrupts_backoff_sleep() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let writer = LedgerWriter::spawn(Arc::clone(&ledger));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    // Backoff far longer than the test
    let policy = RetryPolicy::new(3, Duration::from_secs(30), Duration::from_secs(30), 2.0);
    let started = Instant::now();
    let summary = manager(1, policy)
        .run(
            Box::new(VecTaskSource::new(vec![task(&mock_server.uri(), "x.jpg", dir.path())])),
            writer.handle(),
            cancel,
        )
        .await?;
    writer.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.failed, 0);
    Ok(())
}

// ==================== Ledger and Source Failure Tests ====================

#[tokio::test]
async fn test_ledger_flush_failure_aborts_run() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    // A directory where the archive file should be makes every flush fail
    let archive_path = ArchiveLedger::path_for_output_dir(dir.path());
    std::fs::create_dir_all(&archive_path)?;
    let ledger = Arc::new(ArchiveLedger::empty(&archive_path));

    let tasks: Vec<_> = (1..=4)
        .map(|i| task(&mock_server.uri(), &format!("{i}.jpg"), dir.path()))
        .collect();
    let result = run_tasks(&manager(1, fast_policy(0)), &ledger, tasks).await;

    match result {
        Err(EngineError::LedgerFlush { url, .. }) => assert!(url.ends_with("/1.jpg")),
        other => panic!("expected ledger flush failure, got {other:?}"),
    }
    // The run stopped after the first failed flush
    assert!(mock_server.received_requests().await.unwrap().len() < 4);
    Ok(())
}

#[tokio::test]
async fn test_source_errors_are_counted_not_fatal() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let writer = LedgerWriter::spawn(Arc::clone(&ledger));
    let source = VecTaskSource::from_results(vec![
        Err(SourceError::InvalidEntry {
            line: 1,
            reason: "missing url".into(),
        }),
        Ok(task(&mock_server.uri(), "ok.jpg", dir.path())),
    ]);

    let summary = manager(1, fast_policy(0))
        .run(Box::new(source), writer.handle(), CancellationToken::new())
        .await?;
    writer.shutdown().await;

    assert_eq!(summary.source_errors, 1);
    assert_eq!(summary.downloaded, 1);
    Ok(())
}

// ==================== Auth and Progress Tests ====================

#[tokio::test]
async fn test_auth_headers_are_sent() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(header("x-api-key", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-api-key"),
        HeaderValue::from_static("secret"),
    );

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let manager = manager(1, fast_policy(0)).with_auth(Arc::new(StaticHeaders::new(headers)));

    let summary = run_tasks(
        &manager,
        &ledger,
        vec![task(&mock_server.uri(), "private.jpg", dir.path())],
    )
    .await?;

    assert_eq!(summary.downloaded, 1);
    Ok(())
}

#[tokio::test]
async fn test_progress_events_follow_task_lifecycle() -> TestResult {
    let mock_server = require_mock_server!();
    let hits = Arc::new(AtomicUsize::new(0));
    Mock::given(method("GET"))
        .respond_with(FailThenSucceed {
            hits,
            fail_count: 1,
            status: 500,
        })
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let ledger = open_ledger(dir.path()).await;
    let (sink, mut events) = ChannelSink::new();
    let manager = manager(1, fast_policy(2)).with_progress(Arc::new(sink));

    run_tasks(
        &manager,
        &ledger,
        vec![task(&mock_server.uri(), "p.jpg", dir.path())],
    )
    .await?;
    drop(manager);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push((event.kind, event.attempt));
    }
    assert_eq!(
        kinds,
        vec![
            (ProgressKind::Started, 1),
            (ProgressKind::Retrying, 1),
            (ProgressKind::Started, 2),
            (ProgressKind::Succeeded, 2),
        ]
    );
    Ok(())
}
