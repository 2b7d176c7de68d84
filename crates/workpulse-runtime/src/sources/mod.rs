pub mod file_changes;

pub use file_changes::FileChangeSource;
