//! Reload supervisor tests with a shell stand-in for the worker.

#![cfg(unix)]

use std::fs::{self, File};
use std::os::fd::IntoRawFd;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tokio::sync::broadcast;

use devserve::config::{ReloaderConfig, ReloaderKind};
use devserve::http::HttpServer;
use devserve::net::{ListenTarget, StdListener};
use devserve::reload::{Supervisor, WatchSet, WorkerCommand};

mod common;

use common::{tcp_request, test_app, test_config, unix_request, TestServer};

fn fast_config(kind: ReloaderKind) -> ReloaderConfig {
    ReloaderConfig {
        kind,
        interval_ms: 50,
        ..ReloaderConfig::default()
    }
}

fn listener() -> StdListener {
    StdListener::bind(&ListenTarget::parse("127.0.0.1", 0)).unwrap()
}

fn worker(script: &str) -> WorkerCommand {
    WorkerCommand::new("/bin/sh").arg("-c").arg(script)
}

fn lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

async fn wait_for_lines(path: &Path, count: usize) -> Vec<String> {
    for _ in 0..100 {
        let current = lines(path);
        if current.len() >= count {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("expected {count} lines in {}, got {:?}", path.display(), lines(path));
}

/// Release a bound listener as a bare descriptor, as a supervisor hands it down.
fn into_fd(listener: StdListener) -> std::os::fd::RawFd {
    match listener {
        StdListener::Tcp(listener) => listener.into_raw_fd(),
        StdListener::Unix(listener) => listener.into_raw_fd(),
    }
}

fn touch(path: &Path, secs_ahead: u64) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(secs_ahead))
        .unwrap();
}

#[tokio::test]
async fn test_change_restarts_worker_on_same_socket() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("starts.log");
    let watched = dir.path().join("app.rs");
    fs::write(&watched, "fn main() {}").unwrap();

    let script = format!(
        "if [ -e /dev/fd/$DEVSERVE_SERVER_FD ]; then fd=open; else fd=missing; fi; \
         echo \"$DEVSERVE_RUN_MAIN $fd\" >> {}; exec sleep 30",
        log.display()
    );
    let supervisor = Supervisor::with_watch_set(
        &fast_config(ReloaderKind::Stat),
        WatchSet::new().file(&watched),
        listener(),
        worker(&script),
    )
    .unwrap();

    let (tx, rx) = broadcast::channel(1);
    let task = tokio::spawn(supervisor.run(rx));

    let started = wait_for_lines(&log, 1).await;
    assert_eq!(started[0], "true open");

    touch(&watched, 10);
    let started = wait_for_lines(&log, 2).await;
    assert_eq!(started[1], "true open");

    tx.send(()).unwrap();
    let restarts = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(restarts, 1);
}

#[tokio::test]
async fn test_exit_code_3_restarts_and_0_stops() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("runs.log");

    let script = format!(
        "echo run >> {log}; if [ $(wc -l < {log}) -lt 3 ]; then exit 3; fi; exit 0",
        log = log.display()
    );
    let supervisor = Supervisor::with_watch_set(
        &fast_config(ReloaderKind::Stat),
        WatchSet::new(),
        listener(),
        worker(&script),
    )
    .unwrap();

    let (_tx, rx) = broadcast::channel(1);
    let restarts = tokio::time::timeout(Duration::from_secs(10), supervisor.run(rx))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(restarts, 2);
    assert_eq!(lines(&log).len(), 3);
}

#[tokio::test]
async fn test_crashed_worker_waits_for_change() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("runs.log");
    let watched = dir.path().join("settings.toml");
    fs::write(&watched, "debug = true").unwrap();

    let script = format!("echo run >> {}; exit 1", log.display());
    let supervisor = Supervisor::with_watch_set(
        &fast_config(ReloaderKind::Stat),
        WatchSet::new().file(&watched),
        listener(),
        worker(&script),
    )
    .unwrap();

    let (tx, rx) = broadcast::channel(1);
    let task = tokio::spawn(supervisor.run(rx));

    wait_for_lines(&log, 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(lines(&log).len(), 1);

    touch(&watched, 10);
    wait_for_lines(&log, 2).await;

    tx.send(()).unwrap();
    let restarts = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(restarts, 1);
}

#[tokio::test]
async fn test_notify_reloader_restarts_on_write() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let src = root.join("src");
    fs::create_dir(&src).unwrap();
    let log = root.join("starts.log");

    let script = format!("echo start >> {}; exec sleep 30", log.display());
    let supervisor = Supervisor::with_watch_set(
        &fast_config(ReloaderKind::Notify),
        WatchSet::new().dir(&src),
        listener(),
        worker(&script),
    )
    .unwrap();

    let (tx, rx) = broadcast::channel(1);
    let task = tokio::spawn(supervisor.run(rx));

    wait_for_lines(&log, 1).await;
    fs::write(src.join("page.html"), "<h1>changed</h1>").unwrap();
    wait_for_lines(&log, 2).await;

    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_worker_serves_on_inherited_tcp_socket() {
    let fd = into_fd(listener());

    // SAFETY: `fd` was just released from a listener owned by this test.
    let adopted = unsafe { StdListener::from_raw_fd(fd) }.unwrap();
    let server = HttpServer::new(test_config(), test_app()).from_std(adopted).unwrap();
    let server = TestServer::start_bound(server).await;

    let responses = tcp_request(
        server.socket_addr(),
        b"GET /adopted HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(responses[0].status, 200);
    let environ = responses[0].json();
    assert_eq!(environ["PATH_INFO"], "/adopted");
    assert_eq!(environ["SERVER_NAME"], "127.0.0.1");
    assert_eq!(environ["SERVER_PORT"], server.port().to_string());

    server.stop().await;
}

#[tokio::test]
async fn test_worker_serves_on_inherited_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("worker.sock");
    let target = ListenTarget::parse(&format!("unix://{}", socket.display()), 0);
    let fd = into_fd(StdListener::bind(&target).unwrap());

    // SAFETY: `fd` was just released from a listener owned by this test.
    let adopted = unsafe { StdListener::from_raw_fd(fd) }.unwrap();
    let server = HttpServer::new(test_config(), test_app()).from_std(adopted).unwrap();
    let server = TestServer::start_bound(server).await;

    let responses = unix_request(
        &socket,
        b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(responses[0].status, 200);
    let environ = responses[0].json();
    assert_eq!(environ["SERVER_NAME"], socket.display().to_string());
    assert_eq!(environ["SERVER_PORT"], "0");

    let responses = unix_request(
        &socket,
        b"GET /get-pid HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(responses[0].text(), std::process::id().to_string());

    server.stop().await;
}

#[test]
fn test_inherited_descriptor_must_be_a_socket() {
    let file = tempfile::tempfile().unwrap();
    // SAFETY: ownership of the temp file's descriptor moves into the call.
    let result = unsafe { StdListener::from_raw_fd(file.into_raw_fd()) };
    assert!(matches!(
        result,
        Err(devserve::net::BindError::Inherited { .. })
    ));
}
