//! Processor trait and implementations for pipeline stages.
//!
//! A [`Processor`] is the unit of computation: it receives one sample at a
//! time and forwards 0..N samples (and possibly a replaced header) to its
//! configured sink before returning. Terminal sinks are processors too -
//! they write to the outside world and forward nothing, or pass samples
//! through when further steps follow.
//!
//! Implementations hold a [`BaseProcessor`] and delegate the plumbing
//! (sink slot, stop channel) to it; composition instead of inheritance.

mod batch;
mod builtin;

pub use batch::{BatchProcessor, BatchStep, BatchTrigger};
pub use builtin::{
    DecoupleProcessor, DropErrorsProcessor, DropProcessor, FanInProcessor, NoopProcessor,
    ProcessFn, SimpleProcessor,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::sample::{HeaderRef, Sample};
use crate::task::StopChan;

/// A pipeline stage consuming samples and emitting 0 or more.
///
/// # Contract
///
/// - `sample` is called synchronously by the upstream stage. The
///   implementation may forward any number of samples to its sink before
///   returning; a returned error propagates upstream.
/// - `start` launches background work (most processors have none) and
///   returns a channel that fires when the processor terminates on its own.
/// - `close` is called exactly once, after all upstream stages closed. It
///   must flush buffered state and then close its own sink.
/// - Methods take `&self`; use interior mutability for state. Samples of
///   one linear pipeline arrive sequentially, but a stage fed by several
///   connections or branches may see concurrent `sample` calls.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Human-readable name for logging and error messages.
    fn name(&self) -> String;

    /// The shared plumbing of this processor.
    fn base(&self) -> &BaseProcessor;

    /// Launches background work.
    ///
    /// The default implementation has no background work and returns the
    /// base stop channel, which fires when `close` runs.
    async fn start(&self) -> Result<StopChan, PipelineError> {
        Ok(self.base().stop_chan())
    }

    /// Processes one sample under the header currently in force.
    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError>;

    /// Flushes and closes this processor, then its sink.
    ///
    /// The default implementation just cascades the close downstream.
    async fn close(&self) {
        self.base().close_sink().await;
    }

    /// Offers another processor for fusion with this one.
    ///
    /// Called by the pipeline builder when appending a step. Returning
    /// `true` means this instance absorbed the other's behavior and the
    /// other is discarded. Only valid when the fused result behaves exactly
    /// like the two stages in sequence.
    fn merge_with(&self, _other: &Arc<dyn Processor>) -> bool {
        false
    }

    /// Returns `true` for forks; used by the fork subsystem when a
    /// sub-pipeline ends in a nested fork.
    fn is_fork(&self) -> bool {
        false
    }

    /// Assigns the fork path of the sub-pipeline this stage runs in.
    /// Forks store it; everything else ignores the call.
    fn set_fork_path(&self, _path: &[String]) {}

    /// Probes this stage for a fork remapper serving the given fork path.
    ///
    /// See [`crate::fork`]; everything except remappers answers `None`.
    fn remapped_sink(&self, _path: &[String]) -> Option<Arc<dyn Processor>> {
        None
    }

    /// Probes this stage for the sink behind a fork merger.
    ///
    /// Used when nested forks traverse merger layers to find the real
    /// outgoing sink; everything except mergers answers `None`.
    fn merger_original_sink(&self) -> Option<Arc<dyn Processor>> {
        None
    }
}

/// Shared plumbing held by every processor: the sink slot, the stop
/// channel, and forwarding/closing helpers.
pub struct BaseProcessor {
    name: String,
    sink: parking_lot::Mutex<Option<Arc<dyn Processor>>>,
    stop: StopChan,
    closed: AtomicBool,
}

impl BaseProcessor {
    /// Creates the plumbing for a processor with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sink: parking_lot::Mutex::new(None),
            stop: StopChan::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// The processor name this plumbing was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the downstream sink. Called by the pipeline wiring before
    /// `start`.
    pub fn set_sink(&self, sink: Arc<dyn Processor>) {
        *self.sink.lock() = Some(sink);
    }

    /// The configured downstream sink, if any.
    pub fn sink(&self) -> Option<Arc<dyn Processor>> {
        self.sink.lock().clone()
    }

    /// The stop channel fired when this processor terminates.
    pub fn stop_chan(&self) -> StopChan {
        self.stop.clone()
    }

    /// Reports that this processor failed and has stopped operating.
    pub fn error(&self, err: PipelineError) {
        self.stop.stop_err(err);
    }

    /// Forwards a sample to the sink. A processor without a sink is a
    /// terminal stage; the sample is dropped.
    pub async fn forward(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        match self.sink() {
            Some(sink) => sink.sample(sample, header).await,
            None => Ok(()),
        }
    }

    /// Marks this processor terminated and cascades `close` to the sink.
    /// Idempotent, so wrappers can call it defensively.
    pub async fn close_sink(&self) {
        self.stop.stop();
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(sink) = self.sink() {
                sink.close().await;
            }
        }
    }
}

/// Set of sinks behind a [`crate::fork::Fork`]; delivers an independent
/// clone of each sample to every sink so branches can mutate freely.
pub(crate) async fn fan_out(
    sinks: &[Arc<dyn Processor>],
    sample: Sample,
    header: HeaderRef,
) -> Result<(), PipelineError> {
    let mut errors = crate::error::MultiError::new();
    if let Some((last, rest)) = sinks.split_last() {
        for sink in rest {
            errors.add(sink.sample(sample.clone(), header.clone()).await);
        }
        // The last delivery takes ownership instead of cloning.
        errors.add(last.sample(sample, header).await);
    }
    errors.into_result()
}


#[cfg(test)]
mod tests {
    use super::testutil::{make_sample, CollectingSink};
    use super::*;

    #[tokio::test]
    async fn test_base_forward_without_sink_drops() {
        let base = BaseProcessor::new("x");
        let (sample, header) = make_sample(1.0);
        base.forward(sample, header).await.unwrap();
    }

    #[tokio::test]
    async fn test_base_forward_reaches_sink() {
        let base = BaseProcessor::new("x");
        let sink = CollectingSink::new();
        base.set_sink(sink.clone());

        let (sample, header) = make_sample(2.0);
        base.forward(sample, header).await.unwrap();
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_close_sink_is_idempotent() {
        let base = BaseProcessor::new("x");
        let sink = CollectingSink::new();
        base.set_sink(sink.clone());

        base.close_sink().await;
        base.close_sink().await;
        assert!(sink.was_closed());
        assert!(base.stop_chan().is_stopped());
    }
}
