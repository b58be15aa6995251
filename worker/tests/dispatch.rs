//! End-to-end dispatch against the live mock server.
//!
//! Each test starts the mock server on a random port and a worker on its
//! own thread, enqueues work through a shared `MemoryQueue` (or a second
//! connection to the same SQLite file), and waits for completions.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mock_server::Stats;
use netq_core::{MemoryQueue, Queue, QueueOp, ResponseRecord};
use netq_worker::{
    ConfigSource, ReloadHandle, Settings, SqliteQueue, StopHandle, Worker, WorkerError,
    ABANDONED_MSG,
};

const WAIT: Duration = Duration::from_secs(10);

fn start_server() -> (SocketAddr, Stats) {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let stats = Stats::default();
    let server_stats = stats.clone();

    thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run_with_stats(listener, server_stats).await
        })
        .unwrap();
    });
    (addr, stats)
}

fn settings() -> Settings {
    Settings {
        idle_interval_ms: 50,
        ..Settings::default()
    }
}

struct RunningWorker {
    stop: StopHandle,
    reload: ReloadHandle,
    thread: JoinHandle<Result<(), WorkerError>>,
}

impl RunningWorker {
    fn start<Q: Queue + Send + 'static>(settings: Settings, queue: Q, source: ConfigSource) -> Self {
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || -> Result<(), WorkerError> {
            let worker = Worker::with_source(&settings, queue, source)?;
            let _ = tx.send((worker.stop_handle(), worker.reload_handle()));
            worker.run()
        });
        let (stop, reload) = rx.recv().expect("worker failed to start");
        Self {
            stop,
            reload,
            thread,
        }
    }

    fn shutdown(self) {
        self.stop.stop();
        self.thread.join().unwrap().unwrap();
    }
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for the worker");
        thread::sleep(Duration::from_millis(10));
    }
}

fn completed(queue: &MemoryQueue, id: i64) -> ResponseRecord {
    wait_until(|| queue.is_complete(id));
    queue.response(id).unwrap()
}

fn write_config(path: &Path, ttl: &str) {
    fs::write(path, format!("ttl = \"{ttl}\"\nidle_interval_ms = 50\n")).unwrap();
}

// --- successful transfers ---

#[test]
fn get_with_body_records_status_content_and_headers() {
    let (addr, _) = start_server();
    let queue = MemoryQueue::new();
    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());

    let id = queue.enqueue("GET", &format!("http://{addr}/echo"), &[], Some("ping"));
    let record = completed(&queue, id);
    worker.shutdown();

    assert_eq!(record.status_code, Some(200));
    assert_eq!(record.content.as_deref(), Some("ping"));
    assert_eq!(record.error_msg, None);
    assert!(!record.timed_out);
    assert_eq!(
        record.content_type.as_deref(),
        Some("application/x-www-form-urlencoded")
    );
    let headers = record.headers.unwrap();
    assert_eq!(headers.get("X-Request-Method"), Some("GET"));
    assert_eq!(headers.get("X-User-Agent"), Some("netq/0.1"));
}

#[test]
fn post_keeps_caller_headers_and_tolerates_missing_body() {
    let (addr, _) = start_server();
    let queue = MemoryQueue::new();
    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());

    let url = format!("http://{addr}/echo");
    let with_body = queue.enqueue(
        "post",
        &url,
        &["Content-Type: application/json", "User-Agent: spoofed"],
        Some(r#"{"a":1}"#),
    );
    let empty = queue.enqueue("POST", &url, &[], None);

    let with_body = completed(&queue, with_body);
    let empty = completed(&queue, empty);
    worker.shutdown();

    assert_eq!(with_body.status_code, Some(200));
    assert_eq!(with_body.content.as_deref(), Some(r#"{"a":1}"#));
    assert_eq!(with_body.content_type.as_deref(), Some("application/json"));
    let headers = with_body.headers.unwrap();
    assert_eq!(headers.get("X-Request-Method"), Some("POST"));
    assert_eq!(headers.get("X-User-Agent"), Some("netq/0.1"));

    assert_eq!(empty.status_code, Some(200));
    assert_eq!(empty.content, None);
    assert_eq!(empty.error_msg, None);
}

#[test]
fn non_2xx_statuses_are_results_not_errors() {
    let (addr, _) = start_server();
    let queue = MemoryQueue::new();
    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());

    let id = queue.enqueue("GET", &format!("http://{addr}/status/503"), &[], None);
    let record = completed(&queue, id);
    worker.shutdown();

    assert_eq!(record.status_code, Some(503));
    assert_eq!(record.content.as_deref(), Some("status 503"));
    assert_eq!(record.error_msg, None);
}

#[test]
fn chunked_body_and_repeated_headers_are_kept() {
    let (addr, _) = start_server();
    let queue = MemoryQueue::new();
    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());

    let chunked = queue.enqueue("GET", &format!("http://{addr}/chunked"), &[], None);
    let cookies = queue.enqueue("GET", &format!("http://{addr}/cookies"), &[], None);
    let chunked = completed(&queue, chunked);
    let cookies = completed(&queue, cookies);
    worker.shutdown();

    assert_eq!(chunked.content.as_deref(), Some("first,second,third"));
    assert_eq!(chunked.content_type.as_deref(), Some("text/plain"));

    let set_cookie: Vec<&str> = cookies
        .headers
        .as_ref()
        .unwrap()
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
        .map(|(_, value)| value)
        .collect();
    assert_eq!(set_cookie, vec!["a=1", "b=2"]);
}

#[test]
fn host_names_are_resolved_off_the_reactor() {
    let (addr, _) = start_server();
    let queue = MemoryQueue::new();
    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());

    let url = format!("http://localhost:{}/echo", addr.port());
    let first = queue.enqueue("POST", &url, &[], Some("one"));
    let second = queue.enqueue("POST", &url, &[], Some("two"));
    let first = completed(&queue, first);
    let second = completed(&queue, second);
    worker.shutdown();

    assert_eq!(first.status_code, Some(200));
    assert_eq!(first.content.as_deref(), Some("one"));
    assert_eq!(second.content.as_deref(), Some("two"));
}

// --- failures ---

#[test]
fn refused_connection_records_transport_error() {
    let queue = MemoryQueue::new();
    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());

    let id = queue.enqueue("GET", "http://127.0.0.1:1/", &[], None);
    let record = completed(&queue, id);
    worker.shutdown();

    assert_eq!(record.error_msg.as_deref(), Some("Couldn't connect to server"));
    assert_eq!(record.status_code, None);
    assert_eq!(record.content, None);
    assert_eq!(record.headers, None);
}

#[test]
fn unsupported_method_never_reaches_the_network() {
    let (addr, stats) = start_server();
    let queue = MemoryQueue::new();
    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());

    let id = queue.enqueue("PUT", &format!("http://{addr}/echo"), &[], Some("x"));
    let record = completed(&queue, id);
    worker.shutdown();

    assert_eq!(record.error_msg.as_deref(), Some("Unsupported request method PUT"));
    assert_eq!(queue.placeholder_writes(id), 1);
    assert_eq!(queue.completion_writes(id), 1);
    assert_eq!(stats.snapshot().requests, 0);
}

#[test]
fn bad_urls_fail_with_their_own_messages() {
    let queue = MemoryQueue::new();
    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());

    let garbage = queue.enqueue("GET", "not a url", &[], None);
    let ftp = queue.enqueue("GET", "ftp://127.0.0.1/file", &[], None);
    let garbage = completed(&queue, garbage);
    let ftp = completed(&queue, ftp);
    worker.shutdown();

    assert_eq!(
        garbage.error_msg.as_deref(),
        Some("URL using bad/illegal format or missing URL")
    );
    assert_eq!(ftp.error_msg.as_deref(), Some("Unsupported protocol"));
}

// --- scheduling ---

#[test]
fn connection_cap_bounds_concurrency() {
    let (addr, stats) = start_server();
    let queue = MemoryQueue::new();
    let worker = RunningWorker::start(
        Settings {
            max_connections: 2,
            ..settings()
        },
        queue.clone(),
        ConfigSource::default(),
    );

    let url = format!("http://{addr}/slow/100");
    let ids: Vec<i64> = (0..6).map(|_| queue.enqueue("GET", &url, &[], None)).collect();
    let records: Vec<ResponseRecord> = ids.iter().map(|&id| completed(&queue, id)).collect();
    worker.shutdown();

    assert!(records.iter().all(|r| r.status_code == Some(200)));
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.requests, 6);
    assert!(snapshot.max_in_flight <= 2, "saw {}", snapshot.max_in_flight);
}

#[test]
fn every_item_is_dispatched_and_completed_once() {
    let (addr, stats) = start_server();
    let queue = MemoryQueue::new();
    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());

    let url = format!("http://{addr}/echo");
    let ids: Vec<i64> = (0..10)
        .map(|n| queue.enqueue("POST", &url, &[], Some(&n.to_string())))
        .collect();
    for &id in &ids {
        completed(&queue, id);
    }
    // A few more ticks must not pick anything up again.
    thread::sleep(Duration::from_millis(200));
    worker.shutdown();

    for &id in &ids {
        assert_eq!(queue.placeholder_writes(id), 1);
        assert_eq!(queue.completion_writes(id), 1);
    }
    assert_eq!(stats.snapshot().requests, 10);
}

#[test]
fn expired_rows_are_purged_before_dispatch() {
    let (addr, stats) = start_server();
    let queue = MemoryQueue::new();
    let url = format!("http://{addr}/echo");
    let old = queue.enqueue_aged("GET", &url, &[], None, Duration::from_secs(4 * 86_400));
    let fresh = queue.enqueue("GET", &url, &[], None);

    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());
    completed(&queue, fresh);
    worker.shutdown();

    assert_eq!(queue.queued_ids(), vec![fresh]);
    assert!(queue.response(old).is_none());
    assert_eq!(stats.snapshot().requests, 1);
}

#[test]
fn nothing_is_dispatched_until_the_queue_is_ready() {
    let (addr, stats) = start_server();
    let queue = MemoryQueue::new();
    queue.set_ready(false);
    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());

    let id = queue.enqueue("GET", &format!("http://{addr}/echo"), &[], None);
    thread::sleep(Duration::from_millis(200));
    assert!(queue.response(id).is_none());

    queue.set_ready(true);
    let record = completed(&queue, id);
    worker.shutdown();

    assert_eq!(record.status_code, Some(200));
    assert_eq!(stats.snapshot().requests, 1);
}

// --- lifecycle ---

#[test]
fn stranded_placeholders_are_closed_at_startup() {
    let mut queue = MemoryQueue::new();
    let id = queue.enqueue("GET", "http://127.0.0.1:1/", &[], None);
    queue.insert_placeholder(id).unwrap();

    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());
    let record = completed(&queue, id);
    worker.shutdown();

    assert_eq!(record.error_msg.as_deref(), Some(ABANDONED_MSG));
    assert_eq!(queue.placeholder_writes(id), 1);
}

#[test]
fn reload_picks_up_a_new_ttl() {
    let (addr, stats) = start_server();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("netq.toml");
    write_config(&path, "3 days");
    let source = ConfigSource::new(Some(path.clone()));
    let loaded = source.load().unwrap();

    let queue = MemoryQueue::new();
    queue.set_ready(false);
    let worker = RunningWorker::start(loaded, queue.clone(), source);

    let id = queue.enqueue_aged(
        "GET",
        &format!("http://{addr}/echo"),
        &[],
        None,
        Duration::from_secs(7_200),
    );
    write_config(&path, "1 hour");
    worker.reload.request();
    queue.set_ready(true);

    wait_until(|| queue.queued_ids().is_empty());
    worker.shutdown();

    assert!(queue.response(id).is_none());
    assert_eq!(stats.snapshot().requests, 0);
}

#[test]
fn sqlite_queue_round_trip() {
    let (addr, _) = start_server();
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("queue.db");
    let producer = SqliteQueue::open(&db).unwrap();
    let worker_queue = SqliteQueue::open(&db).unwrap();
    let worker = RunningWorker::start(settings(), worker_queue, ConfigSource::default());

    let id = producer
        .enqueue(
            "POST",
            &format!("http://{addr}/echo"),
            &["Content-Type: text/csv"],
            Some("a,b"),
        )
        .unwrap();
    wait_until(|| {
        producer
            .response(id)
            .unwrap()
            .is_some_and(|record| !record.is_placeholder())
    });
    worker.shutdown();

    let record = producer.response(id).unwrap().unwrap();
    assert_eq!(record.status_code, Some(200));
    assert_eq!(record.content.as_deref(), Some("a,b"));
    assert_eq!(record.content_type.as_deref(), Some("text/csv"));
    assert_eq!(record.headers.unwrap().get("x-request-method"), Some("POST"));
}

// --- storage failures ---

#[test]
fn failed_placeholder_write_is_retried_without_a_second_send() {
    let (addr, stats) = start_server();
    let queue = MemoryQueue::new();
    let id = queue.enqueue("GET", &format!("http://{addr}/echo"), &[], Some("once"));
    queue.fail_on(QueueOp::InsertPlaceholder, "database is locked");

    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());
    let record = completed(&queue, id);
    thread::sleep(Duration::from_millis(200));
    worker.shutdown();

    assert_eq!(record.status_code, Some(200));
    assert_eq!(record.content.as_deref(), Some("once"));
    assert_eq!(queue.placeholder_writes(id), 1);
    assert_eq!(queue.completion_writes(id), 1);
    assert_eq!(stats.snapshot().requests, 1);
}

#[test]
fn failed_completion_write_is_kept_until_it_lands() {
    let (addr, stats) = start_server();
    let queue = MemoryQueue::new();
    let id = queue.enqueue("POST", &format!("http://{addr}/echo"), &[], Some("kept"));
    queue.fail_on(QueueOp::UpdateResponse, "disk full");

    let worker = RunningWorker::start(settings(), queue.clone(), ConfigSource::default());
    let record = completed(&queue, id);
    thread::sleep(Duration::from_millis(200));
    worker.shutdown();

    assert_eq!(record.status_code, Some(200));
    assert_eq!(record.content.as_deref(), Some("kept"));
    assert_eq!(record.error_msg, None);
    assert_eq!(queue.placeholder_writes(id), 1);
    assert_eq!(queue.completion_writes(id), 1);
    assert_eq!(stats.snapshot().requests, 1);
}
