//! End-to-end daemon tests: run the built binary and talk to its socket.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

fn wait_for_socket(path: &Path, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

struct DaemonGuard(Child);

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_daemon(tmp: &Path) -> (DaemonGuard, std::path::PathBuf) {
    let socket = tmp.join("cvrd.sock");
    let child = Command::new(env!("CARGO_BIN_EXE_cvrd"))
        .arg("--socket")
        .arg(&socket)
        .arg("--state-file")
        .arg(tmp.join("state.json"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("daemon should start");
    (DaemonGuard(child), socket)
}

fn request(stream: &mut UnixStream, line: &str) -> String {
    stream.write_all(line.as_bytes()).expect("write request");
    stream.write_all(b"\n").expect("write newline");
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
    let mut response = String::new();
    reader.read_line(&mut response).expect("read response");
    response
}

#[test]
fn help_describes_the_daemon() {
    let output = Command::new(env!("CARGO_BIN_EXE_cvrd"))
        .arg("--help")
        .output()
        .expect("failed to run cvrd --help");

    assert!(output.status.success(), "cvrd --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("cvrd"));
    assert!(stdout.contains("--socket"));
}

#[test]
fn trigger_for_unknown_repo_is_acknowledged_and_dropped() {
    let tmp = tempfile::tempdir().unwrap();
    let (_daemon, socket) = spawn_daemon(tmp.path());
    assert!(wait_for_socket(&socket, Duration::from_secs(15)), "socket never appeared");

    let mut stream = UnixStream::connect(&socket).expect("connect to daemon");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let response = request(
        &mut stream,
        r#"{"command": "trigger", "repo_full_name": "acme/mystery", "branch": "main"}"#,
    );
    assert!(response.contains("dropped"), "got: {response}");
    assert!(response.contains("unknown"), "got: {response}");
}

#[test]
fn status_round_trips_over_the_socket() {
    let tmp = tempfile::tempdir().unwrap();
    let (_daemon, socket) = spawn_daemon(tmp.path());
    assert!(wait_for_socket(&socket, Duration::from_secs(15)), "socket never appeared");

    let mut stream = UnixStream::connect(&socket).expect("connect to daemon");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let response = request(&mut stream, r#"{"command": "status"}"#);
    assert!(response.contains("status"), "got: {response}");
    let parsed: serde_json::Value = serde_json::from_str(response.trim()).unwrap();
    assert_eq!(parsed["repos"], 0);

    let malformed = request(&mut stream, "this is not json");
    assert!(malformed.contains("invalid request"), "got: {malformed}");
}
