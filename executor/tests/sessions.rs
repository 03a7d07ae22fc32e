//! End-to-end runs of the executor against real processes.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vigil_mount::MountSpec;
use vigil_net::SharedEndpoint;
use vigil_net::etcconf::Hosts;

use vigil_executor::{
    DataSource, Executor, ExecutorError, ExecutorOptions, MapStore, NoLogControl, Platform, Reaper,
    SessionConfig, SessionLog, spawn_guard,
};

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MockPlatform {
    root: PathBuf,
    hostnames: Mutex<Vec<String>>,
    logs: Mutex<HashMap<String, (Capture, Capture)>>,
}

impl MockPlatform {
    fn new(root: &Path) -> Arc<Self> {
        std::fs::create_dir_all(root.join("etc")).unwrap();
        Arc::new(Self {
            root: root.to_path_buf(),
            hostnames: Mutex::new(Vec::new()),
            logs: Mutex::new(HashMap::new()),
        })
    }

    fn stdout(&self, id: &str) -> Vec<u8> {
        self.logs.lock().unwrap()[id].0.bytes()
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn set_hostname(&self, hostname: &str) -> Result<(), ExecutorError> {
        self.hostnames.lock().unwrap().push(hostname.to_string());
        Ok(())
    }

    async fn update_hosts(&self, names: &[&str], addr: IpAddr) -> Result<(), ExecutorError> {
        let mut hosts = Hosts::new(&self.root);
        hosts.load()?;
        for name in names {
            hosts.set_host(name, addr);
        }
        hosts.save()?;
        Ok(())
    }

    async fn apply_network(&self, _endpoint: &SharedEndpoint) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn mount(&self, _spec: &MountSpec) -> Result<(), ExecutorError> {
        Ok(())
    }

    fn session_log(&self, session: &SessionConfig) -> Result<SessionLog, ExecutorError> {
        let (out, err) = (Capture::default(), Capture::default());
        self.logs
            .lock()
            .unwrap()
            .insert(session.id.clone(), (out.clone(), err.clone()));
        Ok(SessionLog::Writers {
            stdout: Box::new(out),
            stderr: Box::new(err),
        })
    }
}

struct Harness {
    root: tempfile::TempDir,
    store: Arc<MapStore>,
    platform: Arc<MockPlatform>,
    executor: Executor,
}

fn harness(entries: &[(&str, &str)]) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MapStore::new());
    for (k, v) in entries {
        store.insert(*k, *v);
    }
    let platform = MockPlatform::new(root.path());
    let executor = Executor::new(
        ExecutorOptions {
            root: root.path().to_path_buf(),
            ..Default::default()
        },
        store.clone(),
        store.clone(),
        platform.clone(),
        Arc::new(NoLogControl),
    );
    Harness {
        root,
        store,
        platform,
        executor,
    }
}

async fn run(h: &Harness) -> Result<(), ExecutorError> {
    tokio::time::timeout(Duration::from_secs(20), h.executor.start())
        .await
        .expect("executor did not finish")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_absolute_path_session_output() {
    let h = harness(&[
        ("common/id", "date"),
        ("sessions/date/cmd/path", "/bin/date"),
        ("sessions/date/cmd/args", r#"["date","--reference=/"]"#),
        ("sessions/date/cmd/env", r#"["PATH=/bin:/usr/bin"]"#),
        ("sessions/date/tty", "false"),
    ]);
    run(&h).await.unwrap();

    assert_eq!(h.store.get("sessions/date/started").as_deref(), Some("true"));
    assert_eq!(h.store.get("sessions/date/status").as_deref(), Some("0"));
    assert_ne!(h.store.get("sessions/date/stopTime").as_deref(), Some("0"));

    let expected = {
        let _guard = spawn_guard();
        Command::new("/bin/date")
            .arg("--reference=/")
            .env_clear()
            .env("PATH", "/bin:/usr/bin")
            .env("HOME", "/root")
            .output()
            .unwrap()
            .stdout
    };
    assert_eq!(h.platform.stdout("date"), expected);
    assert!(h.executor.running_pids().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_binary_fails_reload() {
    let h = harness(&[
        ("common/id", "missing"),
        ("sessions/missing/cmd/path", "/not/there"),
    ]);

    let err = run(&h).await.unwrap_err();
    assert!(matches!(err, ExecutorError::Launch { ref id, .. } if id == "missing"));
    assert_eq!(
        h.store.get("sessions/missing/started").as_deref(),
        Some("stat /not/there: no such file or directory")
    );
    assert!(h.executor.running_pids().is_empty());
    assert_eq!(h.executor.session("missing").await.unwrap().pid(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_exec_is_not_fatal() {
    let h = harness(&[
        ("common/id", "main"),
        ("sessions/main/cmd/path", "/bin/true"),
        ("execs/helper/cmd/path", "nowhere-to-be-found"),
        ("execs/helper/cmd/env", r#"["PATH=/nonexistent"]"#),
    ]);

    let exec = h.executor.clone();
    let task = tokio::spawn(async move { exec.start().await });
    wait_for(|| {
        h.store.get("sessions/main/status").is_some() && h.store.get("execs/helper/started").is_some()
    })
    .await;
    h.executor.stop().await;
    task.await.unwrap().unwrap();

    assert_eq!(
        h.store.get("execs/helper/started").as_deref(),
        Some("nowhere-to-be-found: no such executable in PATH")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hostname_truncated_and_hosts_written() {
    let h = harness(&[
        ("common/id", "deadbeefdeadbeefdeadbeef"),
        ("common/name", "example"),
        ("sessions/deadbeefdeadbeefdeadbeef/cmd/path", "/bin/true"),
    ]);
    run(&h).await.unwrap();

    assert_eq!(*h.platform.hostnames.lock().unwrap(), vec!["deadbeefdead"]);

    let mut hosts = Hosts::new(&h.platform.root);
    hosts.load().unwrap();
    let local: IpAddr = "127.0.1.1".parse().unwrap();
    assert_eq!(hosts.host("deadbeefdead"), Some(local));
    assert_eq!(hosts.host("example"), Some(local));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exit_status_recorded() {
    let h = harness(&[
        ("common/id", "exits"),
        ("sessions/three/cmd/path", "/bin/sh"),
        ("sessions/three/cmd/args", r#"["sh","-c","exit 3"]"#),
        ("sessions/killed/cmd/path", "/bin/sh"),
        ("sessions/killed/cmd/args", r#"["sh","-c","kill -9 $$"]"#),
    ]);
    run(&h).await.unwrap();

    assert_eq!(h.store.get("sessions/three/status").as_deref(), Some("3"));
    assert_eq!(h.store.get("sessions/killed/status").as_deref(), Some("-1"));
    for id in ["three", "killed"] {
        let stop: i64 = h.store.get(&format!("sessions/{}/stopTime", id)).unwrap().parse().unwrap();
        assert!(stop > 0);
    }
    let logs = h.store.get("sessions/three/diagnostics/exit_logs").unwrap();
    assert!(logs.contains(r#""exit_status":3"#));

    let pidfiles = h.root.path().join(".tether");
    assert!(pidfiles.join("vigil.pid").exists());
    assert!(!pidfiles.join("sh.pid").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_orphans_are_adopted() {
    let h = harness(&[
        ("common/id", "parent"),
        ("sessions/parent/cmd/path", "/bin/sh"),
        (
            "sessions/parent/cmd/args",
            r#"["sh","-c","sleep 0.3 </dev/null >/dev/null 2>&1 & echo $!"]"#,
        ),
    ]);
    run(&h).await.unwrap();
    assert_eq!(h.store.get("sessions/parent/status").as_deref(), Some("0"));

    let orphan: i32 = String::from_utf8(h.platform.stdout("parent"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let reaper = Reaper::global().unwrap();
    wait_for(|| reaper.adopted().contains(&orphan)).await;
    assert_eq!(h.store.get("sessions/parent/status").as_deref(), Some("0"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_block_waits_for_clearance() {
    let h = harness(&[
        ("common/id", "blocked"),
        ("sessions/blocked/cmd/path", "/bin/echo"),
        ("sessions/blocked/cmd/args", r#"["echo","released"]"#),
        ("sessions/blocked/run_block", "true"),
    ]);

    let exec = h.executor.clone();
    let task = tokio::spawn(async move { exec.start().await });
    let session = loop {
        if let Some(s) = h.executor.session("blocked").await {
            break s;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.pid(), None);
    assert!(session.is_attachable());
    assert!(h.store.get("sessions/blocked/started").is_none());

    session.clear_to_launch();
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(h.store.get("sessions/blocked/started").as_deref(), Some("true"));
    assert_eq!(h.platform.stdout("blocked"), b"released\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_abandons_blocked_launch() {
    let h = harness(&[
        ("common/id", "blocked"),
        ("sessions/blocked/cmd/path", "/bin/true"),
        ("sessions/blocked/run_block", "true"),
    ]);

    let exec = h.executor.clone();
    let task = tokio::spawn(async move { exec.start().await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.executor.session("blocked").await.is_some());
    h.executor.stop().await;
    task.await.unwrap().unwrap();

    assert!(h.executor.running_pids().is_empty());
    assert!(h.store.get("sessions/blocked/started").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_counts_resurrections() {
    let h = harness(&[
        ("common/id", "again"),
        ("sessions/again/cmd/path", "/bin/true"),
        ("sessions/again/restart", "true"),
    ]);

    let exec = h.executor.clone();
    let task = tokio::spawn(async move { exec.start().await });
    wait_for(|| {
        h.store
            .get("sessions/again/diagnostics/resurrections")
            .and_then(|v| v.parse::<u32>().ok())
            .is_some_and(|n| n >= 2)
    })
    .await;
    h.executor.stop().await;
    task.await.unwrap().unwrap();

    let session = h.executor.session("again").await.unwrap();
    assert!(session.resurrections() >= 2);
    assert!(!session.exit_logs().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inactive_session_is_stopped() {
    let h = harness(&[
        ("common/id", "sleeper"),
        ("sessions/sleeper/cmd/path", "/bin/sleep"),
        ("sessions/sleeper/cmd/args", r#"["sleep","30"]"#),
        ("sessions/sleeper/stop_signal", "INT"),
    ]);

    let exec = h.executor.clone();
    let task = tokio::spawn(async move { exec.start().await });
    wait_for(|| h.store.get("sessions/sleeper/started").as_deref() == Some("true")).await;

    h.store.insert("sessions/sleeper/active", "false");
    h.executor.reload();
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(h.store.get("sessions/sleeper/status").as_deref(), Some("-1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tty_session_output() {
    let h = harness(&[
        ("common/id", "console"),
        ("sessions/console/cmd/path", "/bin/sh"),
        ("sessions/console/cmd/args", r#"["sh","-c","test -t 0 && echo on-tty"]"#),
        ("sessions/console/tty", "true"),
    ]);
    run(&h).await.unwrap();

    assert_eq!(h.store.get("sessions/console/status").as_deref(), Some("0"));
    let out = String::from_utf8(h.platform.stdout("console")).unwrap();
    assert!(out.contains("on-tty"), "got {:?}", out);
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}
