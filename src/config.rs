//! Configuration types for pipeline behavior.

use std::time::Duration;

/// Tuning knobs for the parallel marshalling streams.
///
/// One handler value is shared by all sources and sinks built from the same
/// [`EndpointFactory`](crate::endpoint::EndpointFactory).
#[derive(Debug, Clone)]
pub struct ParallelSampleHandler {
    /// Capacity of the in-flight frame queue between the stream's reader
    /// and its ordered consumer. The reader blocks when it is full.
    pub buffered_samples: usize,

    /// Number of worker tasks performing the expensive parse/format step.
    pub parallel_parsers: usize,
}

impl Default for ParallelSampleHandler {
    fn default() -> Self {
        Self {
            buffered_samples: 1000,
            parallel_parsers: 4,
        }
    }
}

/// Configuration for pipeline runtime behavior.
///
/// Use [`PipelineConfig::default()`] for sensible defaults, or customize as
/// needed.
///
/// # Example
///
/// ```
/// use bitflow::PipelineConfig;
/// use std::time::Duration;
///
/// let config = PipelineConfig {
///     shutdown_timeout: Duration::from_secs(5),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How long the task group waits for a task to unwind after `stop()`
    /// was broadcast. Tasks exceeding this are reported but do not block
    /// process exit.
    /// Default: 1s
    pub shutdown_timeout: Duration,

    /// Delay between TCP dial attempts when a remote is unreachable.
    /// Default: 1s
    pub tcp_retry_interval: Duration,

    /// Timeout for a single TCP dial attempt.
    /// Default: 2s
    pub tcp_dial_timeout: Duration,

    /// Whether a TCP source re-dials a remote after its stream ends.
    /// Default: false
    pub tcp_reconnect: bool,

    /// Per-connection buffer of a TCP listener sink, in samples.
    ///
    /// A reader whose buffer overflows is disconnected rather than allowed
    /// to stall the pipeline.
    /// Default: 100
    pub listener_buffer: usize,

    /// Parallel marshalling configuration for all endpoints.
    pub parallel: ParallelSampleHandler,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(1),
            tcp_retry_interval: Duration::from_secs(1),
            tcp_dial_timeout: Duration::from_secs(2),
            tcp_reconnect: false,
            listener_buffer: 100,
            parallel: ParallelSampleHandler::default(),
        }
    }
}
