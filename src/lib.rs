//! Continuous network-health measurement.
//!
//! Probes measure targets on independent cadences; samples are grouped into
//! fixed, epoch-aligned windows, summarised, and delivered to an indexing
//! sink with bounded buffering and retry.

pub mod buffer;
pub mod config;
pub mod counters;
pub mod error;
pub mod exporter;
pub mod pipeline;
pub mod probe;
pub mod retry;
pub mod scheduler;
pub mod util;
pub mod window;

/// Re-export of commonly used types for convenience
pub mod prelude {
    pub use crate::buffer::{PushOutcome, SampleBuffer, SeriesBuffers};
    pub use crate::config::{AppConfig, ConfigBuilder, TargetConfig};
    pub use crate::counters::{Counters, CountersSnapshot};
    pub use crate::error::{AgentError, Result};
    pub use crate::exporter::{EvictionPolicy, ExportHandle, MemorySink, Sink, SinkError};
    pub use crate::pipeline::{Pipeline, PipelineState, ShutdownReport};
    pub use crate::probe::{Metric, Outcome, Probe, ProbeFailure, ProbeKind, Sample, SeriesKey, Target};
    pub use crate::retry::{RetryBuilder, RetryConfig};
    pub use crate::scheduler::{CadenceConfig, CadenceSpec, JitterMode};
    pub use crate::window::{Clock, SystemClock, Window, WindowRecord, WindowSpec};
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
