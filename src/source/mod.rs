//! Sample sources: the upstream ends of a pipeline.
//!
//! A [`SampleSource`] drives samples into the processor chain from the
//! outside world. The crate provides file, TCP (dialing and listening) and
//! standard-input sources plus the synthetic [`EmptySource`]. All byte
//! sources decode through the parallel [`SampleReader`](crate::stream::SampleReader)
//! stream.

mod file;
mod tcp;

pub use file::FileSource;
pub use tcp::{TcpListenerSource, TcpSource};

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ParallelSampleHandler;
use crate::error::PipelineError;
use crate::marshal::Marshaller;
use crate::processor::Processor;
use crate::stream::SampleReader;
use crate::task::StopChan;

/// The upstream end of a pipeline: produces samples and pushes them into
/// the configured sink.
///
/// # Lifecycle
///
/// - `set_sink` is called by the pipeline wiring before `start`.
/// - `start` launches the producing task(s) and returns a channel that
///   fires once the source has terminated *and* the close cascade through
///   its sink has completed.
/// - `stop` requests termination; the source unwinds, closes its sink and
///   then fires the channel.
/// - EOF terminates the source the same way, without an error.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Human-readable name for logging and error messages.
    fn name(&self) -> String;

    /// Sets the first processor of the chain this source feeds.
    fn set_sink(&self, sink: Arc<dyn Processor>);

    /// Launches the producing task(s).
    async fn start(&self) -> Result<StopChan, PipelineError>;

    /// Requests the source to unwind. Must not block.
    fn stop(&self);
}

/// Shared plumbing of sources: the sink slot, the done channel reported to
/// the task group, and the cancel channel fired by `stop()`.
pub struct BaseSource {
    name: String,
    sink: parking_lot::Mutex<Option<Arc<dyn Processor>>>,
    done: StopChan,
    cancel: StopChan,
}

impl BaseSource {
    /// Creates the plumbing for a source with the given name.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            sink: parking_lot::Mutex::new(None),
            done: StopChan::new(),
            cancel: StopChan::new(),
        })
    }

    /// The source name this plumbing was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the downstream sink.
    pub fn set_sink(&self, sink: Arc<dyn Processor>) {
        *self.sink.lock() = Some(sink);
    }

    /// The configured sink, or an error when the wiring never ran.
    pub fn sink(&self) -> Result<Arc<dyn Processor>, PipelineError> {
        self.sink.lock().clone().ok_or_else(|| {
            PipelineError::Config(format!("no sink configured for source '{}'", self.name))
        })
    }

    /// Channel fired once the source terminated and its sink was closed.
    pub fn done(&self) -> StopChan {
        self.done.clone()
    }

    /// Channel the producing tasks watch for external stop requests.
    pub fn cancel_chan(&self) -> StopChan {
        self.cancel.clone()
    }

    /// Requests the producing tasks to unwind.
    pub fn request_stop(&self) {
        self.cancel.stop();
    }

    /// Terminates the source: cascades `close` through the sink, then
    /// fires the done channel with the given result.
    pub async fn finish(&self, result: Result<(), PipelineError>) {
        if let Ok(sink) = self.sink() {
            sink.close().await;
        }
        match result {
            Ok(()) => self.done.stop(),
            Err(err) => self.done.stop_err(err),
        }
    }

    /// Spawns the producing future. When it resolves, the sink is closed
    /// and the done channel fires with its result.
    pub fn spawn_producer<F>(self: &Arc<Self>, fut: F)
    where
        F: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        let base = Arc::clone(self);
        tokio::spawn(async move {
            let result = fut.await;
            base.finish(result).await;
        });
    }
}

/// A source that produces nothing and terminates immediately.
///
/// The synthetic head of script pipelines without an input; generator
/// steps further down the chain produce the actual data.
pub struct EmptySource {
    base: Arc<BaseSource>,
}

impl EmptySource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self {
            base: BaseSource::new("empty://-"),
        }
    }
}

impl Default for EmptySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SampleSource for EmptySource {
    fn name(&self) -> String {
        self.base.name().to_string()
    }

    fn set_sink(&self, sink: Arc<dyn Processor>) {
        self.base.set_sink(sink);
    }

    async fn start(&self) -> Result<StopChan, PipelineError> {
        // Nothing to produce; close the chain right away so downstream
        // generator steps get their close-driven flush.
        self.base.spawn_producer(async { Ok(()) });
        Ok(self.base.done())
    }

    fn stop(&self) {
        self.base.request_stop();
    }
}

/// A source reading framed samples from standard input.
pub struct StdinSource {
    base: Arc<BaseSource>,
    marshaller: Arc<dyn Marshaller>,
    handler: ParallelSampleHandler,
}

impl StdinSource {
    /// Creates a stdin source decoding the given wire format.
    pub fn new(marshaller: Arc<dyn Marshaller>, handler: ParallelSampleHandler) -> Self {
        Self {
            base: BaseSource::new("std://-"),
            marshaller,
            handler,
        }
    }
}

#[async_trait]
impl SampleSource for StdinSource {
    fn name(&self) -> String {
        self.base.name().to_string()
    }

    fn set_sink(&self, sink: Arc<dyn Processor>) {
        self.base.set_sink(sink);
    }

    async fn start(&self) -> Result<StopChan, PipelineError> {
        let sink = self.base.sink()?;
        let reader = SampleReader::new(self.marshaller.clone(), self.handler.clone());
        let cancel = self.base.cancel_chan();
        self.base.spawn_producer(async move {
            let count = reader.read_stream(tokio::io::stdin(), sink, cancel).await?;
            tracing::debug!(samples = count, "stdin source finished");
            Ok(())
        });
        Ok(self.base.done())
    }

    fn stop(&self) {
        self.base.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testutil::CollectingSink;

    #[tokio::test]
    async fn test_empty_source_closes_sink() {
        let source = EmptySource::new();
        let sink = CollectingSink::new();
        source.set_sink(sink.clone());

        let done = source.start().await.unwrap();
        done.wait().await;

        assert_eq!(sink.len(), 0);
        assert!(sink.was_closed());
    }

    #[tokio::test]
    async fn test_base_source_requires_sink() {
        let base = BaseSource::new("x");
        assert!(base.sink().is_err());
    }
}
