//! Per-operation log batching.
//!
//! Every connection and every DNS query accumulates its log lines in a
//! [`LogBatch`] and hands the whole slice to a single [`Drainer`] task at
//! the end. Because only the drainer ever prints, lines from different
//! operations never interleave.

use hickory_proto::op::Message;
use tokio::sync::mpsc;
use tracing::info;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Handle to the single log-printing task.
///
/// Cloneable; each clone feeds the same drainer. The task exits when the
/// last sender is dropped.
#[derive(Clone)]
pub struct Drainer {
    tx: mpsc::UnboundedSender<Vec<String>>,
}

impl Drainer {
    /// Spawn the drainer task and return a handle to it.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<String>>();
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                for line in batch {
                    info!(target: "sixgate::op", "{line}");
                }
            }
        });
        Self { tx }
    }

    /// Start a fresh batch that will flush back to this drainer.
    pub fn batch(&self, string_cutoff: f32) -> LogBatch {
        LogBatch {
            lines: Vec::new(),
            string_cutoff,
            tx: self.tx.clone(),
        }
    }
}

/// Accumulates one operation's log lines; flushed as a unit.
pub struct LogBatch {
    lines: Vec<String>,
    string_cutoff: f32,
    tx: mpsc::UnboundedSender<Vec<String>>,
}

impl LogBatch {
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Log raw bytes with the STRING/JSON/BASE64 heuristic.
    pub fn push_bytes(&mut self, label: &str, bytes: &[u8]) {
        let rendered = stringify_bytes(bytes, self.string_cutoff);
        self.lines.push(format!("{label} {rendered}"));
    }

    /// Append every line of a DNS message rendering.
    pub fn push_dns(&mut self, msg: &Message) {
        for line in format_dns(msg) {
            self.lines.push(line);
        }
    }

    /// Hand the accumulated lines to the drainer.
    pub fn flush(&mut self) {
        if self.lines.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.lines);
        let _ = self.tx.send(batch);
    }
}

impl Drop for LogBatch {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Render possibly-binary bytes for the log.
///
/// All-printable input is shown verbatim (`STRING:`), mostly-printable
/// input is JSON-escaped (`JSON:`), and the rest is base64 (`BASE64:`).
/// `cutoff` is the printable ratio separating the latter two.
pub fn stringify_bytes(bytes: &[u8], cutoff: f32) -> String {
    if bytes.is_empty() {
        return "STRING:".into();
    }

    let printable = bytes.iter().filter(|&&c| (32..=126).contains(&c)).count();
    if printable == bytes.len() {
        return format!("STRING:{}", String::from_utf8_lossy(bytes));
    }
    if printable as f32 / bytes.len() as f32 > cutoff {
        let escaped = serde_json::to_string(&String::from_utf8_lossy(bytes))
            .unwrap_or_else(|_| String::from("\"\""));
        return format!("JSON:{escaped}");
    }
    format!("BASE64:{}", BASE64.encode(bytes))
}

/// Compact multi-line rendering of a DNS message for batched logs.
pub fn format_dns(msg: &Message) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(format!(
        ";; id={} op={:?} rcode={:?} qr={} aa={} tc={} rd={} ra={}",
        msg.id(),
        msg.op_code(),
        msg.response_code(),
        msg.message_type() == hickory_proto::op::MessageType::Response,
        msg.authoritative(),
        msg.truncated(),
        msg.recursion_desired(),
        msg.recursion_available(),
    ));
    for q in msg.queries() {
        lines.push(format!(
            ";; q: {} {:?} {:?}",
            q.name().to_ascii(),
            q.query_class(),
            q.query_type()
        ));
    }
    for (section, records) in [
        ("an", msg.answers()),
        ("ns", msg.name_servers()),
        ("ad", msg.additionals()),
    ] {
        for r in records {
            lines.push(format!(
                ";; {section}: {} {} {:?} {:?}",
                r.name().to_ascii(),
                r.ttl(),
                r.record_type(),
                r.data()
            ));
        }
    }
    lines
}
