/*!
 * Worker IPC
 *
 * Typed message channel between the host and an isolated child.
 *
 * Wire format: one JSON object per line on the child's stdin/stdout, tagged
 * by a `type` field:
 *
 * ```text
 * host  -> child   {"type":"start","entry":"echo","payload":{...}}
 * child -> host    {"type":"ready","pid":4242}
 * child -> host    {"type":"heartbeat","seq":1}
 * child -> host    {"type":"completed","output":{...}}
 * child -> host    {"type":"failed","error":"..."}
 * ```
 *
 * stdout is read by a dedicated task feeding a bounded channel, so the
 * supervisor can race every receive against its deadlines.
 */

use crate::core::errors::RunError;
use crate::core::limits::IPC_CHANNEL_CAPACITY;
use crate::core::types::Pid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Environment variable carrying the heartbeat interval to the child
pub const HEARTBEAT_ENV: &str = "LIFECYCLE_HEARTBEAT_MS";

/// Messages sent by the child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// Handshake acknowledgement
    Ready { pid: Pid },
    Heartbeat { seq: u64 },
    Completed { output: Value },
    Failed { error: String },
}

/// Messages sent by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Start { entry: String, payload: Value },
}

/// Serialize a message as a single NDJSON line
pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line from the child, `None` for blank or foreign output
pub fn decode_child(line: &str) -> Option<ChildMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Host side of a child's IPC channel
pub struct IpcChannel {
    pid: Pid,
    stdin: Option<ChildStdin>,
    messages: mpsc::Receiver<ChildMessage>,
    reader: JoinHandle<()>,
}

impl IpcChannel {
    /// Start reading `stdout`; must be called inside a tokio runtime
    pub fn open(pid: Pid, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let (tx, messages) = mpsc::channel(IPC_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_messages(pid, stdout, tx));
        Self {
            pid,
            stdin: Some(stdin),
            messages,
            reader,
        }
    }

    pub async fn send(&mut self, message: &HostMessage) -> Result<(), RunError> {
        let pid = self.pid;
        let io_error = |cause: String| RunError::Io { pid, cause };

        let line = encode(message).map_err(|e| io_error(e.to_string()))?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io_error("stdin already closed".to_string()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| io_error(e.to_string()))?;
        stdin.flush().await.map_err(|e| io_error(e.to_string()))
    }

    /// Next message; `None` once the child closed its stdout
    pub async fn recv(&mut self) -> Option<ChildMessage> {
        self.messages.recv().await
    }

    /// Collect whatever the child wrote before exiting
    pub async fn drain(&mut self, timeout: Duration) -> Vec<ChildMessage> {
        let mut drained = Vec::new();
        let _ = tokio::time::timeout(timeout, async {
            while let Some(message) = self.messages.recv().await {
                drained.push(message);
            }
        })
        .await;
        drained
    }

    /// Close both directions
    pub fn close(&mut self) {
        self.stdin.take();
        self.messages.close();
        self.reader.abort();
    }
}

impl Drop for IpcChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_messages(pid: Pid, stdout: ChildStdout, tx: mpsc::Sender<ChildMessage>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_child(&line) {
                Some(message) => {
                    trace!(pid, ?message, "child message");
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => debug!(pid, line = %line, "ignoring non-protocol output from child"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(pid, error = %e, "child stdout read failed");
                break;
            }
        }
    }
}
