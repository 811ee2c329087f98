//! Shared fixtures for harness integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serve `GET` on loopback: 503 until `ready_after` has elapsed, then 200.
pub async fn serve_health(ready_after: Duration) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let start = Instant::now();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let ready = start.elapsed() >= ready_after;
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let status = if ready {
                    "200 OK"
                } else {
                    "503 Service Unavailable"
                };
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

/// A loopback port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

/// Write an executable-by-sh script and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write script");
    path
}

/// Target process that appends one line to `$STOP_LOG` per SIGTERM.
pub const TARGET_SCRIPT: &str = r#"#!/bin/sh
trap 'echo stopped >> "$STOP_LOG"; exit 0' TERM
echo "target up"
while :; do sleep 0.1; done
"#;

/// Test runner printing JUnit XML; `RUNNER_EXIT` forces an exit code.
pub const RUNNER_SCRIPT: &str = r#"#!/bin/sh
if [ -n "$RUNNER_EXIT" ]; then
  echo "forced exit $RUNNER_EXIT" >&2
  exit "$RUNNER_EXIT"
fi
cat <<XML
<?xml version="1.0" encoding="UTF-8"?>
<testsuites name="conformance">
  <testsuite name="conformance" file="tests/conformance.rs">
    <testcase name="health" time="0.010"/>
    <testcase name="upload" time="1.234"><failure message="expected 201, got &lt;500&gt;">at $BLOBCHECK_BASE_URL</failure></testcase>
    <testcase name="list" time="0"><skipped message="not implemented"/></testcase>
  </testsuite>
</testsuites>
XML
exit 1
"#;

/// Lines written by [`TARGET_SCRIPT`] on stop.
pub fn stop_count(log: &Path) -> usize {
    std::fs::read_to_string(log)
        .map(|s| s.lines().filter(|l| *l == "stopped").count())
        .unwrap_or(0)
}
