//! Captured output of managed processes.
//!
//! Every attached stream gets its own reader thread. Readers append to a
//! bounded ring buffer (oldest entries evicted) and publish a copy into a
//! bounded handoff queue for the consumer. When the queue is full the newest
//! entry is dropped from the queue only; the ring buffer remains the record
//! of what was captured.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    io::{BufRead, BufReader, ErrorKind, Read},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use serde::Serialize;
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, info, warn};

use crate::{
    constants::{CHILD_LOG_TARGET, DEFAULT_HANDOFF_CAPACITY, DEFAULT_LOG_CAPACITY, STOP_CHECK_STEP},
    lock,
};

/// Which pipe a line was read from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, AsRefStr, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One captured line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// When the reader received the line.
    pub timestamp: DateTime<Local>,
    /// Name of the managed process that produced it.
    pub process: String,
    /// Stream the line came from.
    pub stream: StreamKind,
    /// Line contents without the trailing newline.
    pub text: String,
}

struct PipelineInner {
    capacity: usize,
    buffer: Mutex<VecDeque<LogEntry>>,
    handoff_tx: SyncSender<LogEntry>,
    handoff_rx: Mutex<Receiver<LogEntry>>,
    readers: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    detached: Mutex<HashSet<String>>,
    dropped: AtomicU64,
}

/// Thread-safe handle to the log pipeline. Clones share the same buffers.
#[derive(Clone)]
pub struct LogPipeline {
    inner: Arc<PipelineInner>,
}

impl LogPipeline {
    /// Creates a pipeline keeping at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self::with_handoff_capacity(capacity, DEFAULT_HANDOFF_CAPACITY)
    }

    /// Creates a pipeline with an explicit handoff queue bound.
    pub fn with_handoff_capacity(capacity: usize, handoff_capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (handoff_tx, handoff_rx) = mpsc::sync_channel(handoff_capacity.max(1));

        Self {
            inner: Arc::new(PipelineInner {
                capacity,
                buffer: Mutex::new(VecDeque::with_capacity(capacity)),
                handoff_tx,
                handoff_rx: Mutex::new(handoff_rx),
                readers: Mutex::new(HashMap::new()),
                detached: Mutex::new(HashSet::new()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Maximum number of entries kept in the ring buffer.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Starts one reader thread per stream of process `name`.
    pub fn attach<O, E>(&self, name: &str, stdout: O, stderr: E)
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        self.attach_stream(name, stdout, StreamKind::Stdout);
        self.attach_stream(name, stderr, StreamKind::Stderr);
    }

    /// Starts a reader thread for a single stream.
    pub fn attach_stream<R>(&self, name: &str, stream: R, kind: StreamKind)
    where
        R: Read + Send + 'static,
    {
        lock(&self.inner.detached).remove(name);

        let inner = Arc::clone(&self.inner);
        let process = name.to_string();
        let handle = thread::spawn(move || read_stream(&inner, &process, stream, kind));

        let mut readers = lock(&self.inner.readers);
        let slot = readers.entry(name.to_string()).or_default();
        slot.retain(|handle| !handle.is_finished());
        slot.push(handle);
    }

    /// Marks `name` as intentionally stopping so reader errors are not reported.
    pub fn detach(&self, name: &str) {
        lock(&self.inner.detached).insert(name.to_string());
    }

    /// Waits up to `timeout` for the readers of `name` to reach end-of-stream.
    ///
    /// Returns `false` if some reader is still running when the time runs out.
    pub fn wait_readers(&self, name: &str, timeout: Duration) -> bool {
        let handles = lock(&self.inner.readers).remove(name).unwrap_or_default();
        let leftover = join_until(handles, Instant::now() + timeout);
        let finished = leftover.is_empty();
        if !finished {
            lock(&self.inner.readers)
                .entry(name.to_string())
                .or_default()
                .extend(leftover);
        }
        finished
    }

    /// Returns every entry received since the previous call, without blocking.
    pub fn drain_pending(&self) -> Vec<LogEntry> {
        lock(&self.inner.handoff_rx).try_iter().collect()
    }

    /// Snapshot of the ring buffer, optionally limited to one process.
    pub fn get_logs(&self, filter_by_name: Option<&str>) -> Vec<LogEntry> {
        let buffer = lock(&self.inner.buffer);
        match filter_by_name {
            Some(name) => buffer
                .iter()
                .filter(|entry| entry.process == name)
                .cloned()
                .collect(),
            None => buffer.iter().cloned().collect(),
        }
    }

    /// The last `count` entries in arrival order.
    pub fn recent(&self, count: usize) -> Vec<LogEntry> {
        let buffer = lock(&self.inner.buffer);
        let skip = buffer.len().saturating_sub(count);
        buffer.iter().skip(skip).cloned().collect()
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        lock(&self.inner.buffer).len()
    }

    /// Whether the ring buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes matching entries from the ring buffer. Already drained entries are unaffected.
    pub fn clear(&self, filter_by_name: Option<&str>) {
        let mut buffer = lock(&self.inner.buffer);
        match filter_by_name {
            Some(name) => buffer.retain(|entry| entry.process != name),
            None => buffer.clear(),
        }
    }

    /// Entries that could not be published because the handoff queue was full.
    pub fn dropped_handoffs(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Marks every process detached and joins readers until `timeout` elapses.
    ///
    /// Readers still blocked on a pipe held open by a live process are left
    /// behind; they exit on their own at end-of-stream.
    pub fn shutdown(&self, timeout: Duration) {
        let all: Vec<(String, Vec<JoinHandle<()>>)> =
            lock(&self.inner.readers).drain().collect();

        {
            let mut detached = lock(&self.inner.detached);
            for (name, _) in &all {
                detached.insert(name.clone());
            }
        }

        let deadline = Instant::now() + timeout;
        let mut abandoned = 0;
        for (_, handles) in all {
            abandoned += join_until(handles, deadline).len();
        }

        if abandoned > 0 {
            debug!("{abandoned} log reader(s) still blocked at shutdown");
        }
    }
}

impl Default for LogPipeline {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl std::fmt::Debug for LogPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPipeline")
            .field("capacity", &self.inner.capacity)
            .field("len", &self.len())
            .finish()
    }
}

fn push_entry(inner: &PipelineInner, entry: LogEntry) {
    {
        let mut buffer = lock(&inner.buffer);
        while buffer.len() >= inner.capacity {
            buffer.pop_front();
        }
        buffer.push_back(entry.clone());
    }

    match inner.handoff_tx.try_send(entry) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
            inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn read_stream<R: Read>(inner: &PipelineInner, process: &str, stream: R, kind: StreamKind) {
    debug!("reading {kind} of '{process}'");

    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => {
                debug!("{kind} of '{process}' reached end of stream");
                return;
            }
            Ok(_) => {
                let decoded = String::from_utf8_lossy(&raw);
                let text = decoded.trim_end_matches(['\n', '\r']);
                if text.is_empty() {
                    continue;
                }

                match kind {
                    StreamKind::Stdout => {
                        info!(target: CHILD_LOG_TARGET, process = %process, "{text}")
                    }
                    StreamKind::Stderr => {
                        warn!(target: CHILD_LOG_TARGET, process = %process, "{text}")
                    }
                }

                push_entry(
                    inner,
                    LogEntry {
                        timestamp: Local::now(),
                        process: process.to_string(),
                        stream: kind,
                        text: text.to_string(),
                    },
                );
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                if lock(&inner.detached).contains(process) {
                    debug!("{kind} reader of '{process}' closed: {err}");
                } else {
                    warn!("{kind} reader of '{process}' failed: {err}");
                }
                return;
            }
        }
    }
}

/// Joins handles as they finish, returning those still running at `deadline`.
fn join_until(mut handles: Vec<JoinHandle<()>>, deadline: Instant) -> Vec<JoinHandle<()>> {
    loop {
        let (finished, pending): (Vec<_>, Vec<_>) =
            handles.into_iter().partition(|handle| handle.is_finished());
        for handle in finished {
            let _ = handle.join();
        }

        if pending.is_empty() || Instant::now() >= deadline {
            return pending;
        }

        handles = pending;
        let remaining = deadline.saturating_duration_since(Instant::now());
        thread::sleep(remaining.min(STOP_CHECK_STEP / 2));
    }
}

#[cfg(test)]
impl LogPipeline {
    pub(crate) fn push_line(&self, process: &str, stream: StreamKind, text: &str) {
        push_entry(&self.inner, LogEntry {
            timestamp: Local::now(),
            process: process.to_string(),
            stream,
            text: text.to_string(),
        });
    }
}
