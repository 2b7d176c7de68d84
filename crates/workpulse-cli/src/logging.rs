use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

pub const LOG_LEVEL_ENV: &str = "WORKPULSE_LOG_LEVEL";
pub const SESSION_ENV: &str = "WORKPULSE_SESSION_ID";

type SharedFile = Arc<Mutex<std::fs::File>>;

/// Keeps the log file open for as long as the subscriber lives.
pub struct LogGuard {
    file: Option<SharedFile>,
}

impl LogGuard {
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = lock(file).flush();
        }
    }
}

/// Installs the global subscriber. Console output always works; the file tee
/// is dropped with one diagnostic line if it cannot be opened.
pub fn init_logging(debug: bool, log_dir: &Path, session_id: &str) -> Option<LogGuard> {
    let level = default_level(debug, std::env::var(LOG_LEVEL_ENV).ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(log_dir, session_id) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn default_level(debug: bool, env_level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    match env_level {
        Some(level) if !level.trim().is_empty() => level,
        _ => "info".to_string(),
    }
}

struct MultiWriter {
    stderr: io::Stderr,
    file: Option<SharedFile>,
}

impl MultiWriter {
    fn new(file: Option<SharedFile>) -> Self {
        Self {
            stderr: io::stderr(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stderr.write_all(buf);
        if let Some(file) = &self.file {
            let _ = lock(file).write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stderr.flush();
        if let Some(file) = &self.file {
            let _ = lock(file).flush();
        }
        Ok(())
    }
}

fn lock(file: &SharedFile) -> MutexGuard<'_, std::fs::File> {
    match file.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn open_log_file(log_dir: &Path, session_id: &str) -> io::Result<LogGuard> {
    if log_dir.as_os_str().is_empty() {
        return Ok(LogGuard { file: None });
    }
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(format!("workpulse-{}.log", sanitize_component(session_id)));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

pub fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

pub fn resolve_session_id(explicit: Option<&str>) -> String {
    if let Some(value) = explicit {
        if !value.trim().is_empty() {
            return value.to_string();
        }
    }
    if let Ok(value) = std::env::var(SESSION_ENV) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    format!("pid-{}", std::process::id())
}
