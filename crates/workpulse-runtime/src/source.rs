use crate::filters;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::io;
use thiserror::Error;
use workpulse_core::{validate_label, Event, EventError, SourceSpec};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("emit failed: {0}")]
    Emit(String),
    #[error("filter failed: {0}")]
    Filter(String),
    #[error("source io failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid event: {0}")]
    Event(#[from] EventError),
}

/// An in-process monitoring source polled by the runtime.
///
/// Emission and aggregation are separate: `emit_event` describes one
/// observation, `filter` folds a segment's worth of buffered payload values
/// into the single value stored on the segment.
pub trait Source: Send {
    fn spec(&self) -> SourceSpec;

    fn emit_event(&mut self, now: DateTime<Utc>) -> Result<Option<Event>, SourceError>;

    fn filter(&self, values: Vec<Value>) -> Result<Value, SourceError> {
        Ok(filters::identity(values))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("source label already registered: {0}")]
    DuplicateLabel(String),
    #[error("invalid source label: {0}")]
    InvalidLabel(#[from] EventError),
}

pub struct RegisteredSource {
    spec: SourceSpec,
    source: Box<dyn Source>,
}

impl RegisteredSource {
    pub fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    pub fn label(&self) -> &str {
        &self.spec.label
    }

    pub fn emit_event(&mut self, now: DateTime<Utc>) -> Result<Option<Event>, SourceError> {
        self.source.emit_event(now)
    }

    pub fn filter(&self, values: Vec<Value>) -> Result<Value, SourceError> {
        self.source.filter(values)
    }
}

/// Label -> source table in registration order. Labels are fixed once
/// registered; only scheduling metadata may be changed afterwards.
#[derive(Default)]
pub struct SourceRegistry {
    entries: Vec<RegisteredSource>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Box<dyn Source>) -> Result<(), RegistryError> {
        let spec = source.spec();
        self.register_with_spec(spec, source)
    }

    /// Registers `source` under `spec` instead of the spec the source reports,
    /// used when configuration overrides scheduling flags.
    pub fn register_with_spec(
        &mut self,
        spec: SourceSpec,
        source: Box<dyn Source>,
    ) -> Result<(), RegistryError> {
        validate_label(&spec.label)?;
        if self.get(&spec.label).is_some() {
            return Err(RegistryError::DuplicateLabel(spec.label));
        }
        self.entries.push(RegisteredSource { spec, source });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.spec.label.clone())
            .collect()
    }

    pub fn get(&self, label: &str) -> Option<&RegisteredSource> {
        self.entries.iter().find(|entry| entry.spec.label == label)
    }

    pub fn get_mut(&mut self, label: &str) -> Option<&mut RegisteredSource> {
        self.entries
            .iter_mut()
            .find(|entry| entry.spec.label == label)
    }

    pub fn spec(&self, label: &str) -> Option<&SourceSpec> {
        self.get(label).map(RegisteredSource::spec)
    }

    pub fn set_poll_interval(&mut self, label: &str, interval: Duration) -> bool {
        match self.get_mut(label) {
            Some(entry) => {
                entry.spec.poll_interval = interval;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredSource> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RegisteredSource> {
        self.entries.iter_mut()
    }

    pub fn owners_of_header(&self, header: &str) -> Vec<&RegisteredSource> {
        self.entries
            .iter()
            .filter(|entry| entry.spec.data_header() == Some(header))
            .collect()
    }
}
