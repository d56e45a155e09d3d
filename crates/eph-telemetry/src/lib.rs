//! JSON-lines telemetry for EPH worlds.
//!
//! Every telemetry batch becomes one `tick` row followed by one `agent` row per agent.
//! [`TelemetryPipeline`] moves the encoding and file IO onto a worker thread so the
//! simulation loop never waits on disk.

use eph_core::geometry::Vec2;
use eph_core::spm::Spm;
use eph_core::{AgentRecord, ContactFlags, TelemetryBatch, TelemetrySink, Tick, TickSummary};
use serde::Serialize;
use slotmap::Key;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use thiserror::Error;
use tracing::{debug, error, warn};

const DEFAULT_FLUSH_THRESHOLD: usize = 4096;

/// Telemetry error wrapper.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("telemetry encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("telemetry worker error: {0}")]
    Worker(String),
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Row<'a> {
    Tick(&'a TickSummary),
    Agent(AgentRow<'a>),
}

#[derive(Serialize)]
struct AgentRow<'a> {
    tick: Tick,
    agent_id: u64,
    group: u16,
    position: Vec2,
    velocity: Vec2,
    heading: f64,
    action: Vec2,
    precision: f64,
    self_haze: f64,
    contacts: ContactFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    spm: Option<&'a Spm>,
}

impl<'a> AgentRow<'a> {
    fn new(tick: Tick, record: &'a AgentRecord) -> Self {
        Self {
            tick,
            agent_id: record.id.data().as_ffi(),
            group: record.group.0,
            position: record.position,
            velocity: record.velocity,
            heading: record.heading,
            action: record.action,
            precision: record.precision,
            self_haze: record.self_haze,
            contacts: record.contacts,
            spm: record.spm.as_ref(),
        }
    }
}

/// Buffered JSON-lines encoder for telemetry batches.
#[derive(Debug)]
pub struct JsonLinesWriter<W: Write> {
    out: BufWriter<W>,
    rows_since_flush: usize,
    flush_threshold: usize,
    ticks_written: u64,
}

impl JsonLinesWriter<File> {
    /// Create (or truncate) a telemetry file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, TelemetryError> {
        Ok(Self::new(File::create(path)?))
    }
}

impl<W: Write> JsonLinesWriter<W> {
    pub fn new(writer: W) -> Self {
        Self::with_threshold(writer, DEFAULT_FLUSH_THRESHOLD)
    }

    /// Flush after at least `flush_threshold` buffered rows.
    pub fn with_threshold(writer: W, flush_threshold: usize) -> Self {
        Self {
            out: BufWriter::new(writer),
            rows_since_flush: 0,
            flush_threshold: flush_threshold.max(1),
            ticks_written: 0,
        }
    }

    /// Encode one batch; rows are keyed by `(tick, agent_id)`.
    pub fn write_batch(&mut self, batch: &TelemetryBatch) -> Result<(), TelemetryError> {
        let tick = batch.summary.tick;
        self.write_row(&Row::Tick(&batch.summary))?;
        for record in &batch.agents {
            self.write_row(&Row::Agent(AgentRow::new(tick, record)))?;
        }
        self.ticks_written += 1;
        if self.rows_since_flush >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    fn write_row(&mut self, row: &Row<'_>) -> Result<(), TelemetryError> {
        serde_json::to_writer(&mut self.out, row)?;
        self.out.write_all(b"\n")?;
        self.rows_since_flush += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), TelemetryError> {
        self.out.flush()?;
        self.rows_since_flush = 0;
        Ok(())
    }

    #[must_use]
    pub const fn ticks_written(&self) -> u64 {
        self.ticks_written
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(self) -> Result<W, TelemetryError> {
        self.out
            .into_inner()
            .map_err(|err| TelemetryError::Io(err.into_error()))
    }
}

impl<W: Write + Send> TelemetrySink for JsonLinesWriter<W> {
    fn on_tick(&mut self, batch: &TelemetryBatch) {
        if let Err(err) = self.write_batch(batch) {
            warn!(tick = batch.summary.tick.0, %err, "failed to write telemetry batch");
        }
    }
}

enum TelemetryCommand {
    Write(Box<TelemetryBatch>),
    Shutdown,
}

/// Asynchronous telemetry sink backed by a worker thread.
pub struct TelemetryPipeline {
    tx: mpsc::Sender<TelemetryCommand>,
    written: Arc<AtomicU64>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TelemetryPipeline {
    /// Create a pipeline writing JSON lines to `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, TelemetryError> {
        Self::from_writer(JsonLinesWriter::create(path)?)
    }

    pub fn from_writer<W>(writer: JsonLinesWriter<W>) -> Result<Self, TelemetryError>
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<TelemetryCommand>();
        let written = Arc::new(AtomicU64::new(0));
        let worker_written = Arc::clone(&written);
        let mut writer = writer;
        let handle = thread::Builder::new()
            .name("eph-telemetry-worker".into())
            .spawn(move || {
                while let Ok(command) = rx.recv() {
                    match command {
                        TelemetryCommand::Write(batch) => match writer.write_batch(&batch) {
                            Ok(()) => {
                                worker_written.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => {
                                error!(tick = batch.summary.tick.0, %err, "failed to write telemetry");
                            }
                        },
                        TelemetryCommand::Shutdown => break,
                    }
                }
                if let Err(err) = writer.flush() {
                    error!(%err, "failed to flush telemetry on shutdown");
                }
                debug!(ticks = writer.ticks_written(), "telemetry worker stopped");
            })
            .map_err(|err| {
                TelemetryError::Worker(format!("failed to spawn telemetry worker thread: {err}"))
            })?;

        Ok(Self {
            tx,
            written,
            handle: Some(handle),
        })
    }

    /// Batches the worker has finished encoding.
    #[must_use]
    pub fn batches_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for TelemetryPipeline {
    fn on_tick(&mut self, batch: &TelemetryBatch) {
        if self
            .tx
            .send(TelemetryCommand::Write(Box::new(batch.clone())))
            .is_err()
        {
            warn!(
                tick = batch.summary.tick.0,
                "telemetry worker channel closed; batch dropped"
            );
        }
    }
}

impl Drop for TelemetryPipeline {
    fn drop(&mut self) {
        let _ = self.tx.send(TelemetryCommand::Shutdown);
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.join()
        {
            error!("telemetry worker thread panicked: {err:?}");
        }
    }
}

/// Read back the `tick` rows of a telemetry file, skipping agent rows.
pub fn read_summaries(path: impl AsRef<Path>) -> Result<Vec<TickSummary>, TelemetryError> {
    let reader = BufReader::new(File::open(path)?);
    let mut summaries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut value: serde_json::Value = serde_json::from_str(&line)?;
        let Some(object) = value.as_object_mut() else {
            continue;
        };
        if object.remove("kind").and_then(|k| k.as_str().map(str::to_owned)).as_deref()
            != Some("tick")
        {
            continue;
        }
        summaries.push(serde_json::from_value(value)?);
    }
    Ok(summaries)
}
