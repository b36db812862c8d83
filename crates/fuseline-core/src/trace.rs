//! Tracing sink
//!
//! An append-only stream of flat execution events. The sink is write-only
//! from the core's perspective; the default file sink appends one JSON
//! record per line. Tracers are passed explicitly through workflow
//! construction, there is no process-global sink.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};

/// One flat trace record.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl TraceEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            step: None,
            workflow_id: None,
            workflow_instance_id: None,
            timestamp: None,
            data: Map::new(),
        }
    }

    /// Attach the step label.
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Attach an extra flat field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Interface for recording workflow execution events.
pub trait Tracer: Send + Sync {
    fn record(&self, event: TraceEvent);
}

/// Writes trace events to a file as JSON lines.
pub struct FileTracer {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileTracer {
    /// Open `path` for appending, creating it if needed so repeated runs
    /// share one file.
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Tracer for FileTracer {
    fn record(&self, mut event: TraceEvent) {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now().to_rfc3339());
        }
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize trace event");
                return;
            }
        };
        let mut file = self.file.lock();
        if let Err(err) = writeln!(file, "{line}") {
            tracing::warn!(error = %err, path = %self.path.display(), "failed to append trace event");
        }
    }
}

/// Tracer that injects workflow identifiers into each event.
#[derive(Clone)]
pub struct BoundTracer {
    inner: Arc<dyn Tracer>,
    workflow_id: String,
    instance_id: String,
}

impl BoundTracer {
    pub fn new(
        inner: Arc<dyn Tracer>,
        workflow_id: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            workflow_id: workflow_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl Tracer for BoundTracer {
    fn record(&self, mut event: TraceEvent) {
        if event.workflow_id.is_none() {
            event.workflow_id = Some(self.workflow_id.clone());
        }
        if event.workflow_instance_id.is_none() {
            event.workflow_instance_id = Some(self.instance_id.clone());
        }
        self.inner.record(event);
    }
}

/// Tracer collecting events in memory, for tests and inspection.
#[derive(Default)]
pub struct MemoryTracer {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemoryTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Number of events with the given `event` field.
    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| e.event == event).count()
    }
}

impl Tracer for MemoryTracer {
    fn record(&self, mut event: TraceEvent) {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now().to_rfc3339());
        }
        self.events.lock().push(event);
    }
}
