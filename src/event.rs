//! Runtime events for monitoring pipeline health.
//!
//! Events are non-fatal notifications about pipeline behavior. The pipeline
//! continues running after events are emitted - they're for logging/metrics,
//! not error handling.

use std::sync::Arc;

/// Runtime events emitted while a pipeline is running.
///
/// These are informational events, not errors. Use the [`EventCallback`] to
/// log them or update metrics; by default the emitting components also log
/// through `tracing`.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A TCP listener sink disconnected a reader whose buffer overflowed.
    ///
    /// The drop-slow policy: a stalled reader is cut off so fast readers
    /// and the pipeline itself keep flowing.
    SlowReaderDisconnected {
        /// Peer address of the disconnected reader.
        peer: String,
        /// Number of samples that had queued up when it was cut off.
        buffered: usize,
    },

    /// A TCP source established a connection to a remote.
    SourceConnected {
        /// The remote endpoint.
        remote: String,
    },

    /// A TCP source lost or finished a connection.
    SourceDisconnected {
        /// The remote endpoint.
        remote: String,
        /// Why the connection ended.
        reason: String,
    },

    /// A forked sub-pipeline terminated.
    SubpipelineFinished {
        /// Fork path of the sub-pipeline.
        path: Vec<String>,
        /// Error message if it failed, `None` on clean termination.
        error: Option<String>,
    },

    /// The schema changed mid-stream: a new header was announced.
    HeaderChanged {
        /// Field names of the new header.
        fields: Vec<String>,
    },
}

/// Callback type for receiving runtime events.
pub type EventCallback = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use bitflow::{event_callback, PipelineEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(PipelineEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_event_debug() {
        let event = PipelineEvent::SlowReaderDisconnected {
            peer: "127.0.0.1:1234".to_string(),
            buffered: 2,
        };
        let debug = format!("{:?}", event);
        assert!(debug.contains("SlowReaderDisconnected"));
        assert!(debug.contains("1234"));
    }

    #[test]
    fn test_event_callback_helper() {
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(PipelineEvent::HeaderChanged { fields: vec![] });
        assert!(called.load(Ordering::SeqCst));
    }
}
