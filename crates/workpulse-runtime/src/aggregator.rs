use crate::source::{SourceError, SourceRegistry};
use serde_json::Value;
use std::collections::BTreeMap;
use std::mem;
use thiserror::Error;
use workpulse_core::{Event, EventRef, Segment, SegmentState};

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("filter for source {label} failed on header {header}: {source}")]
    Filter {
        label: String,
        header: String,
        #[source]
        source: SourceError,
    },
    #[error("no registered source owns header {header}")]
    NoOwner { header: String },
    #[error("header {header} is owned by several sources: {labels:?}")]
    AmbiguousHeader { header: String, labels: Vec<String> },
}

impl AggregationError {
    pub fn header(&self) -> &str {
        match self {
            Self::Filter { header, .. }
            | Self::NoOwner { header }
            | Self::AmbiguousHeader { header, .. } => header,
        }
    }
}

/// Buffers one open segment's events and per-header payload values.
#[derive(Debug, Default)]
pub struct SegmentAggregator {
    events: Vec<EventRef>,
    buffers: BTreeMap<String, Vec<Value>>,
}

impl SegmentAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn buffered(&self, header: &str) -> Option<&[Value]> {
        self.buffers.get(header).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.buffers.is_empty()
    }

    pub fn add_event(&mut self, event: &Event, registry: &SourceRegistry) {
        self.events.push(event.to_ref());
        let Some(header) = registry
            .spec(event.label())
            .and_then(|spec| spec.data_header())
        else {
            return;
        };
        if let Some(value) = event.payload_value(header) {
            self.buffers
                .entry(header.to_string())
                .or_default()
                .push(value.clone());
        }
    }

    /// Folds every buffered header through its owning source's filter. The
    /// buffers are emptied whether or not the fold succeeds, so a segment can
    /// be built at most once.
    pub fn build_segment(
        &mut self,
        state: SegmentState,
        registry: &SourceRegistry,
    ) -> Result<Segment, AggregationError> {
        let events = mem::take(&mut self.events);
        let buffers = mem::take(&mut self.buffers);

        let mut aggregated = BTreeMap::new();
        for (header, values) in buffers {
            let owners = registry.owners_of_header(&header);
            let owner = match owners.as_slice() {
                [owner] => *owner,
                [] => return Err(AggregationError::NoOwner { header }),
                many => {
                    let labels = many.iter().map(|owner| owner.label().to_string()).collect();
                    return Err(AggregationError::AmbiguousHeader { header, labels });
                }
            };
            let folded = owner
                .filter(values)
                .map_err(|source| AggregationError::Filter {
                    label: owner.label().to_string(),
                    header: header.clone(),
                    source,
                })?;
            aggregated.insert(header, folded);
        }

        Ok(Segment::from_state(state, events, aggregated))
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.buffers.clear();
    }
}
