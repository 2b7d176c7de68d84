use crate::filters;
use crate::source::{Source, SourceError};
use chrono::{DateTime, Duration, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, warn};
use workpulse_core::{Event, Payload, SourceSpec};

pub const FILE_CHANGES_LABEL: &str = "file_changes";
pub const FILES_HEADER: &str = "files";
pub const FILE_CHANGE_EVENT: &str = "file_change";

enum WatchSignal {
    Changed(PathBuf),
    Failed(String),
}

/// Watches paths recursively and reports the files touched since the last
/// poll as one `file_change` event.
pub struct FileChangeSource {
    spec: SourceSpec,
    signals: Receiver<WatchSignal>,
    pending: BTreeSet<PathBuf>,
    _watcher: Option<RecommendedWatcher>,
}

impl FileChangeSource {
    pub fn default_spec() -> SourceSpec {
        SourceSpec::new(FILE_CHANGES_LABEL)
            .with_data_header(FILES_HEADER)
            .resetting(true)
            .poll_every(Duration::seconds(1))
    }

    pub fn watch(paths: &[PathBuf]) -> Result<Self, SourceError> {
        let (tx, rx) = mpsc::channel();
        let callback_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            forward_notification(&callback_tx, res);
        })
        .map_err(|err| SourceError::Emit(format!("watcher init failed: {err}")))?;

        let mut watched = 0;
        for path in paths {
            if !path.exists() {
                warn!(event = "watch_path_missing", path = %path.display());
                continue;
            }
            match watcher.watch(path, RecursiveMode::Recursive) {
                Ok(()) => watched += 1,
                Err(err) => warn!(event = "watch_failed", path = %path.display(), error = %err),
            }
        }
        if watched == 0 && !paths.is_empty() {
            return Err(SourceError::Emit("no configured path could be watched".to_string()));
        }
        drop(tx);

        let mut source = Self::from_receiver(rx);
        source._watcher = Some(watcher);
        Ok(source)
    }

    fn from_receiver(signals: Receiver<WatchSignal>) -> Self {
        Self {
            spec: Self::default_spec(),
            signals,
            pending: BTreeSet::new(),
            _watcher: None,
        }
    }

    pub fn with_spec(mut self, spec: SourceSpec) -> Self {
        self.spec = spec;
        self
    }

    fn collect_signals(&mut self) -> Option<String> {
        let mut failure = None;
        while let Ok(signal) = self.signals.try_recv() {
            match signal {
                WatchSignal::Changed(path) => {
                    self.pending.insert(path);
                }
                WatchSignal::Failed(message) => failure = Some(message),
            }
        }
        failure
    }
}

fn forward_notification(tx: &Sender<WatchSignal>, result: notify::Result<notify::Event>) {
    match result {
        Ok(event) => {
            if event.kind.is_access() {
                return;
            }
            for path in event.paths {
                let _ = tx.send(WatchSignal::Changed(path));
            }
        }
        Err(err) => {
            let _ = tx.send(WatchSignal::Failed(err.to_string()));
        }
    }
}

impl Source for FileChangeSource {
    fn spec(&self) -> SourceSpec {
        self.spec.clone()
    }

    fn emit_event(&mut self, now: DateTime<Utc>) -> Result<Option<Event>, SourceError> {
        if let Some(failure) = self.collect_signals() {
            return Err(SourceError::Emit(failure));
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        let files: Vec<Value> = std::mem::take(&mut self.pending)
            .into_iter()
            .map(|path| Value::String(path.display().to_string()))
            .collect();
        debug!(event = "files_changed", count = files.len());
        let mut payload = Payload::new();
        payload.insert(FILES_HEADER.to_string(), Value::Array(files));
        let event = Event::new(self.spec.label.clone(), FILE_CHANGE_EVENT, now)?;
        Ok(Some(event.with_payload(payload)))
    }

    fn filter(&self, values: Vec<Value>) -> Result<Value, SourceError> {
        Ok(filters::dedupe_sorted(values))
    }
}
