mod support;

use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use support::{clone_dir, reposync_cmd, Remote};

struct DaemonProcess {
    child: Child,
    home: PathBuf,
}

impl DaemonProcess {
    fn start(home: PathBuf) -> Self {
        let child = reposync_cmd(&home)
            .args(["daemon", "start"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");
        Self { child, home }
    }

    fn stop(&mut self) {
        let _ = reposync_cmd(&self.home).args(["daemon", "stop"]).status();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            sleep(Duration::from_millis(50));
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn daemon_running(home: &Path) -> bool {
    let output = match reposync_cmd(home).args(["daemon", "status"]).output() {
        Ok(output) => output,
        Err(_) => return false,
    };
    if !output.status.success() {
        return false;
    }

    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&output.stdout) else {
        return false;
    };
    value
        .get("running")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn status_without_daemon_reports_not_running() {
    let home = TempDir::new().expect("home");

    let output = reposync_cmd(home.path())
        .args(["daemon", "status"])
        .output()
        .expect("status");
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(value["running"], false);

    reposync_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
}

#[test]
fn cli_sync_is_served_by_a_running_daemon() {
    let home = TempDir::new().expect("home");
    let remote = Remote::new();
    reposync_cmd(home.path())
        .args(["repo", "add", "acme/wiki", &remote.url(), "--enable"])
        .assert()
        .success();

    let mut daemon = DaemonProcess::start(home.path().to_path_buf());
    assert!(
        wait_until(Duration::from_secs(5), || daemon_running(home.path())),
        "daemon did not report running state in time",
    );

    // Registered while the daemon is up: a reload picks it up.
    reposync_cmd(home.path())
        .args(["repo", "add", "acme/notes", &remote.url(), "--enable"])
        .assert()
        .success();
    reposync_cmd(home.path())
        .args(["daemon", "reload"])
        .assert()
        .success()
        .stdout(contains("daemon reloaded 2 repositories"));

    remote.publish("guide/intro.md", "hello\n");

    reposync_cmd(home.path())
        .args(["sync", "--all"])
        .assert()
        .success()
        .stdout(contains("2 attempted, 2 ok, 0 failed"));
    assert!(clone_dir(home.path(), "acme/wiki").join("guide/intro.md").exists());
    assert!(clone_dir(home.path(), "acme/notes").join("guide/intro.md").exists());

    let output = reposync_cmd(home.path())
        .args(["daemon", "status"])
        .output()
        .expect("status");
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(status["scheduler"]["last_batch"]["attempted"], 2);

    daemon.stop();
    assert!(daemon.exited(), "daemon should exit after stop");
    assert!(!daemon_running(home.path()));
}

#[test]
fn repo_update_and_remove_are_served_by_a_running_daemon() {
    let home = TempDir::new().expect("home");
    let remote = Remote::new();
    reposync_cmd(home.path())
        .args(["repo", "add", "acme/wiki", &remote.url(), "--enable"])
        .assert()
        .success();

    let _daemon = DaemonProcess::start(home.path().to_path_buf());
    assert!(
        wait_until(Duration::from_secs(5), || daemon_running(home.path())),
        "daemon did not report running state in time",
    );

    // No reload in between: the daemon's own view only changes if it did
    // the work itself.
    reposync_cmd(home.path())
        .args(["repo", "update", "acme/wiki", "--disable"])
        .assert()
        .success()
        .stdout(contains("enabled=false"));
    let status = daemon_status(home.path());
    assert_eq!(status["repositories"][0]["enabled"], false);

    reposync_cmd(home.path())
        .args(["repo", "remove", "acme/wiki"])
        .assert()
        .success()
        .stdout(contains("removed acme/wiki"));
    let status = daemon_status(home.path());
    assert_eq!(status["repositories"], serde_json::json!([]));
    assert!(!clone_dir(home.path(), "acme/wiki").exists());

    reposync_cmd(home.path())
        .args(["repo", "remove", "acme/wiki"])
        .assert()
        .failure()
        .stderr(contains("daemon could not remove 'acme/wiki'"))
        .stderr(contains("not found"));
}

fn daemon_status(home: &Path) -> serde_json::Value {
    let output = reposync_cmd(home)
        .args(["daemon", "status"])
        .output()
        .expect("status");
    serde_json::from_slice(&output.stdout).expect("json")
}
