//! Bounded capture of target process output.
//!
//! Target stdout/stderr are drained continuously by background tasks into a
//! fixed-capacity ring that drops the oldest line when full. The drain never
//! waits on a consumer, so a noisy target can neither block on a full pipe
//! nor grow harness memory without bound.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::trace;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// One captured line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
}

/// Fixed-capacity, drop-oldest line buffer tagged with the target name.
#[derive(Debug)]
pub struct LogRing {
    target: String,
    capacity: usize,
    lines: VecDeque<LogLine>,
    dropped: u64,
}

/// Ring shared between the drain tasks and the controller.
pub type SharedLogRing = Arc<Mutex<LogRing>>;

impl LogRing {
    /// A capacity of 0 is treated as 1.
    pub fn new(target: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            target: target.into(),
            capacity,
            lines: VecDeque::with_capacity(capacity),
            dropped: 0,
        }
    }

    pub fn shared(target: impl Into<String>, capacity: usize) -> SharedLogRing {
        Arc::new(Mutex::new(Self::new(target, capacity)))
    }

    pub fn push(&mut self, stream: LogStream, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(LogLine { stream, line });
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines evicted so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn lines(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }

    /// Render as `[target][stream] line` text, noting evictions.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.dropped > 0 {
            out.push_str(&format!(
                "[{}] ... {} earlier line(s) dropped\n",
                self.target, self.dropped
            ));
        }
        for entry in &self.lines {
            out.push_str(&format!(
                "[{}][{}] {}\n",
                self.target,
                entry.stream.as_str(),
                entry.line
            ));
        }
        out
    }

    /// Last `n` lines, newline-joined, for diagnostics.
    pub fn tail(&self, n: usize) -> String {
        let skip = self.lines.len().saturating_sub(n);
        self.lines
            .iter()
            .skip(skip)
            .map(|l| l.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Drain `reader` line by line into `ring` until EOF.
pub fn spawn_capture<R>(reader: R, stream: LogStream, ring: SharedLogRing) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(mut guard) = ring.lock() else {
                break;
            };
            trace!(target_name = %guard.target(), stream = stream.as_str(), %line, "target output");
            guard.push(stream, line);
        }
    })
}

/// Render a shared ring, tolerating a poisoned lock.
pub fn render_shared(ring: &SharedLogRing) -> String {
    match ring.lock() {
        Ok(guard) => guard.render(),
        Err(poisoned) => poisoned.into_inner().render(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest() {
        let mut ring = LogRing::new("t", 3);
        for i in 0..5 {
            ring.push(LogStream::Stdout, format!("line {i}"));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.dropped(), 2);
        let kept: Vec<&str> = ring.lines().map(|l| l.line.as_str()).collect();
        assert_eq!(kept, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_zero_capacity_keeps_one_line() {
        let mut ring = LogRing::new("t", 0);
        ring.push(LogStream::Stderr, "a".to_string());
        ring.push(LogStream::Stderr, "b".to_string());
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.lines().next().map(|l| l.line.as_str()), Some("b"));
    }

    #[test]
    fn test_render_tags_target_and_stream() {
        let mut ring = LogRing::new("minio", 1);
        ring.push(LogStream::Stdout, "old".to_string());
        ring.push(LogStream::Stderr, "listening on :9000".to_string());
        let text = ring.render();
        assert!(text.contains("1 earlier line(s) dropped"));
        assert!(text.contains("[minio][stderr] listening on :9000"));
        assert!(!text.contains("old"));
    }

    #[test]
    fn test_tail_returns_most_recent_lines() {
        let mut ring = LogRing::new("t", 10);
        for i in 0..4 {
            ring.push(LogStream::Stdout, format!("l{i}"));
        }
        assert_eq!(ring.tail(2), "l2\nl3");
        assert_eq!(ring.tail(10), "l0\nl1\nl2\nl3");
    }

    #[tokio::test]
    async fn test_capture_drains_reader() {
        let ring = LogRing::shared("t", 2);
        let data: &[u8] = b"one\ntwo\nthree\n";
        spawn_capture(data, LogStream::Stdout, ring.clone())
            .await
            .expect("capture task");
        let guard = ring.lock().expect("lock");
        let kept: Vec<&str> = guard.lines().map(|l| l.line.as_str()).collect();
        assert_eq!(kept, vec!["two", "three"]);
        assert_eq!(guard.dropped(), 1);
    }
}
