use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use workpulse_core::{Event, Segment};

pub const SEGMENTS_FILE: &str = "segments.jsonl";
pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink io failed: {0}")]
    Io(#[from] io::Error),
    #[error("sink encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("sink is closed")]
    Closed,
}

/// Output collaborator. Sink failures are logged by the runtime and never
/// stop the tick loop.
pub trait Sink: Send {
    fn name(&self) -> &str;

    fn write_segment(&mut self, segment: &Segment) -> Result<(), SinkError>;

    fn write_event(&mut self, event: &Event) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.flush()
    }
}

/// Appends one JSON object per line, segments and events in separate files.
pub struct JsonlSink {
    root: PathBuf,
    segments: Option<BufWriter<File>>,
    events: Option<BufWriter<File>>,
}

impl JsonlSink {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let segments = open_append(&root.join(SEGMENTS_FILE))?;
        let events = open_append(&root.join(EVENTS_FILE))?;
        Ok(Self {
            root,
            segments: Some(segments),
            events: Some(events),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn open_append(path: &Path) -> Result<BufWriter<File>, SinkError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn write_record<T: Serialize>(
    writer: Option<&mut BufWriter<File>>,
    kind: &str,
    record: &T,
) -> Result<(), SinkError> {
    let writer = writer.ok_or(SinkError::Closed)?;
    let mut value = serde_json::to_value(record)?;
    if let Value::Object(object) = &mut value {
        object.insert("kind".to_string(), Value::String(kind.to_string()));
    }
    serde_json::to_writer(&mut *writer, &value)?;
    writer.write_all(b"\n")?;
    Ok(())
}

impl Sink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn write_segment(&mut self, segment: &Segment) -> Result<(), SinkError> {
        write_record(self.segments.as_mut(), "segment", segment)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), SinkError> {
        write_record(self.events.as_mut(), "event", event)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        for writer in [self.segments.as_mut(), self.events.as_mut()]
            .into_iter()
            .flatten()
        {
            writer.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.flush()?;
        self.segments = None;
        self.events = None;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryRecords {
    pub segments: Vec<Segment>,
    pub events: Vec<Event>,
    pub flushes: usize,
    pub closed: bool,
}

/// Records writes in memory; clones of the handle observe the same records.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<MemoryRecords>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MemoryRecords {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.snapshot().segments
    }

    pub fn events(&self) -> Vec<Event> {
        self.snapshot().events
    }

    fn with_records<T>(&self, apply: impl FnOnce(&mut MemoryRecords) -> T) -> T {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut records)
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn write_segment(&mut self, segment: &Segment) -> Result<(), SinkError> {
        self.with_records(|records| {
            if records.closed {
                return Err(SinkError::Closed);
            }
            records.segments.push(segment.clone());
            Ok(())
        })
    }

    fn write_event(&mut self, event: &Event) -> Result<(), SinkError> {
        self.with_records(|records| {
            if records.closed {
                return Err(SinkError::Closed);
            }
            records.events.push(event.clone());
            Ok(())
        })
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.with_records(|records| records.flushes += 1);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.with_records(|records| {
            records.flushes += 1;
            records.closed = true;
        });
        Ok(())
    }
}
