use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use babel_core::types::ChunkId;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Initializing,
    Streaming,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Failed | StreamState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub index: usize,
    pub chunk_id: ChunkId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamProgress {
    pub completed: usize,
    pub total: usize,
    pub percent: f64,
    pub elapsed_secs: f64,
    pub chunks_per_sec: f64,
    pub estimated_remaining_secs: Option<f64>,
}

/// Translates one chunk. Supplied by the caller.
#[async_trait]
pub trait ChunkTranslator: Send + Sync + 'static {
    async fn translate(&self, chunk_id: &ChunkId, text: &str) -> Result<String>;
}

/// Delivery interface for translated chunks.
///
/// Intentionally synchronous; a slow sink must exert backpressure so the
/// producer cannot outrun the output.
pub trait StreamSink: Send + Sync + 'static {
    fn write_chunks(&self, chunks: &[StreamChunk]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Flush the buffer to the sink every this many produced chunks.
    pub write_interval: usize,
    /// Capacity of the per-chunk delivery channel.
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            write_interval: 5,
            channel_capacity: 32,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.write_interval >= 1, "write_interval must be >= 1");
        anyhow::ensure!(self.channel_capacity >= 1, "channel_capacity must be >= 1");
        Ok(())
    }
}

struct Shared {
    state: Mutex<StreamState>,
    cancelled: AtomicBool,
    completed: AtomicUsize,
    total: usize,
    started: Instant,
    // true = gate open, producer may run.
    gate_tx: watch::Sender<bool>,
}

/// Control surface for a running stream.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
}

impl StreamHandle {
    pub fn state(&self) -> StreamState {
        *lock(&self.shared.state)
    }

    /// Close the gate. Only meaningful while streaming.
    pub fn pause(&self) -> bool {
        let mut state = lock(&self.shared.state);
        if *state != StreamState::Streaming {
            return false;
        }
        *state = StreamState::Paused;
        let _ = self.shared.gate_tx.send(false);
        info!(event = "stream_paused", "stream paused");
        true
    }

    pub fn resume(&self) -> bool {
        let mut state = lock(&self.shared.state);
        if *state != StreamState::Paused {
            return false;
        }
        *state = StreamState::Streaming;
        let _ = self.shared.gate_tx.send(true);
        info!(event = "stream_resumed", "stream resumed");
        true
    }

    /// Cooperative cancel. Opens the gate so a paused producer can observe
    /// the flag and exit; already-produced chunks are still flushed.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Relaxed);
        let _ = self.shared.gate_tx.send(true);
        info!(event = "stream_cancel_requested", "stream cancel requested");
    }

    pub fn progress(&self) -> StreamProgress {
        let completed = self.shared.completed.load(Ordering::Relaxed);
        let total = self.shared.total;
        let elapsed = self.shared.started.elapsed().as_secs_f64();
        let percent = if total == 0 {
            100.0
        } else {
            completed as f64 / total as f64 * 100.0
        };
        let estimated_remaining_secs = if completed > 0 && completed < total {
            Some(elapsed / completed as f64 * (total - completed) as f64)
        } else {
            None
        };
        let chunks_per_sec = if elapsed > 0.0 {
            completed as f64 / elapsed
        } else {
            0.0
        };
        StreamProgress {
            completed,
            total,
            percent,
            elapsed_secs: elapsed,
            chunks_per_sec,
            estimated_remaining_secs,
        }
    }
}

/// Incremental translator: processes units strictly in order, delivering each
/// translated chunk on the returned channel and flushing batches of
/// `write_interval` chunks to the sink.
///
/// Returns the chunk channel, a control handle, and the producer task. The
/// task resolves to the terminal state.
pub fn spawn_stream<T, S>(
    translator: Arc<T>,
    sink: Arc<S>,
    units: Vec<(ChunkId, String)>,
    cfg: StreamConfig,
) -> Result<(
    mpsc::Receiver<StreamChunk>,
    StreamHandle,
    tokio::task::JoinHandle<Result<StreamState>>,
)>
where
    T: ChunkTranslator,
    S: StreamSink,
{
    cfg.validate()?;

    let (gate_tx, gate_rx) = watch::channel(true);
    let shared = Arc::new(Shared {
        state: Mutex::new(StreamState::Initializing),
        cancelled: AtomicBool::new(false),
        completed: AtomicUsize::new(0),
        total: units.len(),
        started: Instant::now(),
        gate_tx,
    });
    let handle = StreamHandle {
        shared: shared.clone(),
    };

    let (tx, rx) = mpsc::channel::<StreamChunk>(cfg.channel_capacity);

    let producer = {
        let shared = shared.clone();
        tokio::spawn(async move {
            run_producer(translator, sink, units, cfg, shared, tx, gate_rx).await
        })
    };

    Ok((rx, handle, producer))
}

async fn run_producer<T, S>(
    translator: Arc<T>,
    sink: Arc<S>,
    units: Vec<(ChunkId, String)>,
    cfg: StreamConfig,
    shared: Arc<Shared>,
    tx: mpsc::Sender<StreamChunk>,
    mut gate_rx: watch::Receiver<bool>,
) -> Result<StreamState>
where
    T: ChunkTranslator,
    S: StreamSink,
{
    set_state(&shared, StreamState::Streaming);
    let mut buffer: Vec<StreamChunk> = Vec::with_capacity(cfg.write_interval);

    for (index, (chunk_id, text)) in units.into_iter().enumerate() {
        // Block here while paused. Cancel opens the gate.
        if gate_rx.wait_for(|open| *open).await.is_err() {
            break;
        }
        if shared.cancelled.load(Ordering::Relaxed) {
            flush_or_fail(&sink, &mut buffer, &shared).await?;
            set_state(&shared, StreamState::Cancelled);
            info!(
                event = "stream_cancelled",
                completed = shared.completed.load(Ordering::Relaxed),
                "stream cancelled"
            );
            return Ok(StreamState::Cancelled);
        }

        let translated = match translator.translate(&chunk_id, &text).await {
            Ok(translated) => translated,
            Err(err) => {
                // Chunks produced before the failure still reach the sink.
                flush_or_fail(&sink, &mut buffer, &shared).await?;
                set_state(&shared, StreamState::Failed);
                warn!(
                    event = "stream_failed",
                    chunk_id = %chunk_id,
                    chunk_index = index,
                    error = %err,
                    "stream failed"
                );
                return Err(err);
            }
        };

        let chunk = StreamChunk {
            index,
            chunk_id,
            text: translated,
        };
        buffer.push(chunk.clone());
        shared.completed.fetch_add(1, Ordering::Relaxed);

        // Receiver gone means nobody is watching per-chunk output; the sink
        // still gets everything.
        let _ = tx.send(chunk).await;

        if buffer.len() >= cfg.write_interval {
            flush_or_fail(&sink, &mut buffer, &shared).await?;
        }
    }

    flush_or_fail(&sink, &mut buffer, &shared).await?;
    if shared.cancelled.load(Ordering::Relaxed) {
        set_state(&shared, StreamState::Cancelled);
        return Ok(StreamState::Cancelled);
    }
    set_state(&shared, StreamState::Completed);
    info!(
        event = "stream_completed",
        total = shared.total,
        "stream completed"
    );
    Ok(StreamState::Completed)
}

/// Flush with the terminal-state guarantee: a sink error marks the stream
/// `Failed` before it propagates, so no run ends stuck in a live state.
async fn flush_or_fail<S: StreamSink>(
    sink: &Arc<S>,
    buffer: &mut Vec<StreamChunk>,
    shared: &Arc<Shared>,
) -> Result<()> {
    match flush(sink, buffer).await {
        Ok(()) => Ok(()),
        Err(err) => {
            set_state(shared, StreamState::Failed);
            warn!(event = "stream_sink_failed", error = %err, "sink write failed");
            Err(err)
        }
    }
}

async fn flush<S: StreamSink>(sink: &Arc<S>, buffer: &mut Vec<StreamChunk>) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let chunks = std::mem::take(buffer);
    let sink = sink.clone();
    // Run delivery in a blocking thread so a slow sink exerts backpressure
    // without stalling the runtime.
    tokio::task::spawn_blocking(move || sink.write_chunks(&chunks))
        .await
        .map_err(anyhow::Error::from)??;
    Ok(())
}

fn set_state(shared: &Shared, next: StreamState) {
    let mut state = lock(&shared.state);
    if !state.is_terminal() {
        *state = next;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
