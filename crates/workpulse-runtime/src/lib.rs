pub mod aggregator;
pub mod config;
pub mod filters;
pub mod legacy;
pub mod runtime;
pub mod sink;
pub mod source;
pub mod sources;

pub use aggregator::{AggregationError, SegmentAggregator};
pub use config::{load_settings, AgentSettings, ConfigError, RuntimeSettings, SourceSettings};
pub use legacy::LegacySourceAdapter;
pub use runtime::{
    HealthSnapshot, Runtime, RuntimeBuilder, RuntimeFault, ShutdownReport, TickReport,
    APP_VERSION,
};
pub use sink::{JsonlSink, MemorySink, Sink, SinkError};
pub use source::{RegisteredSource, RegistryError, Source, SourceError, SourceRegistry};
pub use sources::FileChangeSource;
