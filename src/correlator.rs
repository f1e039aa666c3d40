//! Traffic stream correlation
//!
//! A stream is configured on one agent (`traffic_agent_config` answers with
//! its id), started with `traffic_agent_send`, and measured when the send
//! completes or when the receiving side is stopped. Completion lines of
//! running sends arrive asynchronously; a background thread per phase
//! polls the transport's readiness set and folds them into the table.
//!
//! Counter lines keep their fields at fixed comma positions:
//!
//! ```text
//! status,COMPLETE,streamID,<id>,txFrames,<n>,rxFrames,<n>,txBytes,<n>,rxBytes,<n>
//!    0       1       2      3      4      5     6      7     8      9     10     11
//! ```
//!
//! Each value may be a space-separated list when one command covers
//! several streams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::symbols::lock;
use crate::transport::ConnectionPool;

pub const STREAM_ID: usize = 3;
pub const TX_FRAMES: usize = 5;
pub const RX_FRAMES: usize = 7;
pub const TX_BYTES: usize = 9;
pub const RX_BYTES: usize = 11;

/// Readiness poll interval of the background thread
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Configured,
    Running,
    Complete,
}

/// A configured stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: String,
    pub address: String,
    /// Stream on the other side of the flow
    pub pair_id: Option<String>,
    pub direction: Direction,
    pub traffic_class: String,
    pub frame_rate: String,
    pub phase: usize,
    pub status: StreamStatus,
}

impl StreamInfo {
    /// Describe a stream from the parameters of its config command.
    pub fn from_config(stream_id: &str, address: &str, params: &str, phase: usize) -> Self {
        let fields: Vec<&str> = params.split(',').map(str::trim).collect();
        let value = |key: &str| {
            fields
                .chunks(2)
                .find(|kv| kv[0].eq_ignore_ascii_case(key))
                .and_then(|kv| kv.get(1))
                .map(|v| v.to_string())
                .unwrap_or_default()
        };
        let direction = if value("direction").eq_ignore_ascii_case("receive") {
            Direction::Receive
        } else {
            Direction::Send
        };
        Self {
            stream_id: stream_id.to_string(),
            address: address.to_string(),
            pair_id: None,
            direction,
            traffic_class: value("trafficClass"),
            frame_rate: value("frameRate"),
            phase,
            status: StreamStatus::Configured,
        }
    }
}

/// Measured counters of one stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamResult {
    pub stream_id: String,
    pub address: String,
    pub rx_frames: u64,
    pub tx_frames: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub phase: usize,
}

/// Parse a counter line. Lines without a stream id yield nothing.
pub fn parse_counters(address: &str, line: &str, phase: usize) -> Vec<StreamResult> {
    let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
    let ids = match fields.get(STREAM_ID) {
        Some(ids) if fields.get(STREAM_ID - 1).map(|k| k.eq_ignore_ascii_case("streamID")) == Some(true) => {
            ids.split_whitespace().collect::<Vec<_>>()
        }
        _ => return Vec::new(),
    };
    let column = |offset: usize, i: usize| -> u64 {
        fields
            .get(offset)
            .and_then(|v| v.split_whitespace().nth(i))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };
    ids.iter()
        .enumerate()
        .map(|(i, id)| StreamResult {
            stream_id: id.to_string(),
            address: address.to_string(),
            tx_frames: column(TX_FRAMES, i),
            rx_frames: column(RX_FRAMES, i),
            tx_bytes: column(TX_BYTES, i),
            rx_bytes: column(RX_BYTES, i),
            phase,
        })
        .collect()
}

#[derive(Debug, Default)]
struct Streams {
    infos: Vec<StreamInfo>,
    sent: Vec<StreamResult>,
    received: Vec<StreamResult>,
}

impl Streams {
    fn find(&mut self, address: &str, id: &str, phase: usize) -> Option<&mut StreamInfo> {
        self.infos
            .iter_mut()
            .find(|s| s.address == address && s.stream_id == id && s.phase == phase)
    }
}

/// Stream infos and the measured send/receive arrays
#[derive(Debug, Default)]
pub struct StreamTable {
    inner: Mutex<Streams>,
    changed: Condvar,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a configured stream and pair it with the oldest unpaired
    /// stream of the opposite direction in the same phase.
    pub fn register(&self, mut info: StreamInfo) {
        let mut streams = lock(&self.inner);
        let partner = streams.infos.iter_mut().find(|s| {
            s.phase == info.phase && s.direction != info.direction && s.pair_id.is_none()
        });
        if let Some(partner) = partner {
            partner.pair_id = Some(info.stream_id.clone());
            info.pair_id = Some(partner.stream_id.clone());
        }
        let (address, id, phase) = (info.address.clone(), info.stream_id.clone(), info.phase);
        match streams.find(&address, &id, phase) {
            Some(existing) => *existing = info,
            None => streams.infos.push(info),
        }
    }

    /// Mark streams as started. Unknown ids are registered as sends.
    pub fn mark_running(&self, address: &str, ids: &[String], phase: usize) {
        let mut streams = lock(&self.inner);
        for id in ids {
            match streams.find(address, id, phase) {
                Some(info) => info.status = StreamStatus::Running,
                None => {
                    let mut info = StreamInfo::from_config(id, address, "", phase);
                    info.status = StreamStatus::Running;
                    streams.infos.push(info);
                }
            }
        }
    }

    /// Append a measured result and complete the matching stream.
    pub fn record(&self, result: StreamResult) {
        let mut streams = lock(&self.inner);
        if let Some(info) = streams.find(&result.address, &result.stream_id, result.phase) {
            info.status = StreamStatus::Complete;
        }
        tracing::debug!(
            stream = %result.stream_id,
            address = %result.address,
            tx_frames = result.tx_frames,
            rx_frames = result.rx_frames,
            "stream result"
        );
        if result.tx_frames > 0 {
            streams.sent.push(result);
        } else {
            streams.received.push(result);
        }
        drop(streams);
        self.changed.notify_all();
    }

    /// Fold one response line into the table; returns how many results it carried.
    pub fn absorb(&self, address: &str, line: &str, phase: usize) -> usize {
        if !line.to_ascii_uppercase().contains("COMPLETE") {
            return 0;
        }
        let results = parse_counters(address, line, phase);
        let n = results.len();
        for result in results {
            self.record(result);
        }
        n
    }

    /// True if `address` has a send stream still running.
    pub fn busy(&self, address: &str) -> bool {
        lock(&self.inner)
            .infos
            .iter()
            .any(|s| s.address == address && s.status == StreamStatus::Running)
    }

    /// Block until no stream on `address` is running. Returns false on timeout.
    pub fn wait_idle(&self, address: &str, timeout: Duration) -> bool {
        self.wait_until(timeout, |streams| {
            !streams
                .infos
                .iter()
                .any(|s| s.address == address && s.status == StreamStatus::Running)
        })
    }

    /// Block until the running send streams paired with any of `receive_ids`
    /// complete. Unpaired receivers wait for every running send of the phase.
    pub fn wait_for_pairs(&self, receive_ids: &[String], phase: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |streams| {
            let paired: Vec<&StreamInfo> = streams
                .infos
                .iter()
                .filter(|s| s.phase == phase && s.direction == Direction::Send)
                .filter(|s| {
                    s.pair_id
                        .as_ref()
                        .map(|p| receive_ids.contains(p))
                        .unwrap_or(false)
                })
                .collect();
            let waiting_on: Vec<&StreamInfo> = if paired.is_empty() {
                streams
                    .infos
                    .iter()
                    .filter(|s| s.phase == phase && s.direction == Direction::Send)
                    .collect()
            } else {
                paired
            };
            waiting_on.iter().all(|s| s.status != StreamStatus::Running)
        })
    }

    fn wait_until<F>(&self, timeout: Duration, done: F) -> bool
    where
        F: Fn(&Streams) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut streams = lock(&self.inner);
        loop {
            if done(&streams) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            streams = match self.changed.wait_timeout(streams, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Latest received result for `stream_id`, preferring `phase`.
    pub fn received_for(&self, stream_id: &str, phase: usize) -> Option<StreamResult> {
        let streams = lock(&self.inner);
        let mut matching = streams.received.iter().rev().filter(|r| r.stream_id == stream_id);
        let in_phase = streams
            .received
            .iter()
            .rev()
            .find(|r| r.stream_id == stream_id && r.phase == phase);
        in_phase.or_else(|| matching.next()).cloned()
    }

    pub fn infos(&self) -> Vec<StreamInfo> {
        lock(&self.inner).infos.clone()
    }

    pub fn sent(&self) -> Vec<StreamResult> {
        lock(&self.inner).sent.clone()
    }

    pub fn received(&self) -> Vec<StreamResult> {
        lock(&self.inner).received.clone()
    }
}

struct PhaseWorker {
    phase: usize,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owns the stream table and the per-phase background thread
pub struct Correlator {
    table: Arc<StreamTable>,
    pool: Arc<ConnectionPool>,
    worker: Mutex<Option<PhaseWorker>>,
}

impl Correlator {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            table: Arc::new(StreamTable::new()),
            pool,
            worker: Mutex::new(None),
        }
    }

    pub fn table(&self) -> &StreamTable {
        &self.table
    }

    /// Start the background thread for `phase` unless it already runs.
    pub fn ensure_running(&self, phase: usize) {
        let mut worker = lock(&self.worker);
        if let Some(w) = worker.as_ref() {
            if w.phase == phase && !w.handle.is_finished() {
                return;
            }
        }
        if let Some(old) = worker.take() {
            stop_worker(old);
        }

        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = Arc::clone(&running);
            let table = Arc::clone(&self.table);
            let pool = Arc::clone(&self.pool);
            std::thread::spawn(move || poll_loop(phase, &running, &table, &pool))
        };
        tracing::debug!(phase, "stream correlator started");
        *worker = Some(PhaseWorker {
            phase,
            running,
            handle,
        });
    }

    /// Stop the background thread of the current phase, if any.
    pub fn end_phase(&self) {
        if let Some(old) = lock(&self.worker).take() {
            stop_worker(old);
        }
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.end_phase();
    }
}

fn stop_worker(worker: PhaseWorker) {
    worker.running.store(false, Ordering::SeqCst);
    if worker.handle.join().is_err() {
        tracing::error!(phase = worker.phase, "stream correlator panicked");
    }
    tracing::debug!(phase = worker.phase, "stream correlator stopped");
}

fn poll_loop(phase: usize, running: &AtomicBool, table: &StreamTable, pool: &ConnectionPool) {
    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        let lines = pool.poll_ready(Duration::from_millis(10));
        for (address, line) in &lines {
            if line.to_ascii_uppercase().contains("RUNNING") {
                continue;
            }
            if table.absorb(address, line, phase) > 0 && !table.busy(address) {
                pool.unwatch(address);
            }
        }
        if lines.is_empty() {
            if let Some(rest) = POLL_INTERVAL.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
    }
}
