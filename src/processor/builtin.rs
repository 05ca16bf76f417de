//! Generic built-in processors.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::PipelineError;
use crate::sample::{HeaderRef, Sample};
use crate::task::StopChan;

use super::{BaseProcessor, Processor};

/// Passes every sample through unchanged.
pub struct NoopProcessor {
    base: BaseProcessor,
}

impl NoopProcessor {
    /// Creates a passthrough processor.
    pub fn new() -> Self {
        Self {
            base: BaseProcessor::new("noop"),
        }
    }
}

impl Default for NoopProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for NoopProcessor {
    fn name(&self) -> String {
        "noop".into()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        self.base.forward(sample, header).await
    }

    /// Two adjacent passthroughs behave like one; absorb the second.
    fn merge_with(&self, other: &std::sync::Arc<dyn Processor>) -> bool {
        other.name() == "noop"
    }
}

/// Swallows every sample; the end of a branch that should discard data.
pub struct DropProcessor {
    base: BaseProcessor,
}

impl DropProcessor {
    /// Creates a sample sink hole.
    pub fn new() -> Self {
        Self {
            base: BaseProcessor::new("drop"),
        }
    }
}

#[async_trait]
impl Processor for DropProcessor {
    fn name(&self) -> String {
        "drop".into()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn sample(&self, _sample: Sample, _header: HeaderRef) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// The per-sample function run by a [`SimpleProcessor`]. Returning `None`
/// drops the sample; returning a different header announces a schema change.
pub type ProcessFn = Box<
    dyn Fn(Sample, HeaderRef) -> Result<Option<(Sample, HeaderRef)>, PipelineError> + Send + Sync,
>;

/// Adapts a plain function into a processor.
pub struct SimpleProcessor {
    base: BaseProcessor,
    description: String,
    process: ProcessFn,
}

impl SimpleProcessor {
    /// Creates a processor that runs `process` on every sample.
    pub fn new(description: impl Into<String>, process: ProcessFn) -> Self {
        let description = description.into();
        Self {
            base: BaseProcessor::new(description.clone()),
            description,
            process,
        }
    }
}

#[async_trait]
impl Processor for SimpleProcessor {
    fn name(&self) -> String {
        self.description.clone()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        match (self.process)(sample, header)? {
            Some((sample, header)) => self.base.forward(sample, header).await,
            None => Ok(()),
        }
    }
}

/// Suppresses errors of all subsequent steps: downstream failures are
/// logged at the configured level and not propagated upstream.
pub struct DropErrorsProcessor {
    base: BaseProcessor,
    log_error: bool,
    log_warn: bool,
    log_info: bool,
    log_debug: bool,
}

impl DropErrorsProcessor {
    /// Creates a suppressor logging dropped errors at error level.
    pub fn new() -> Self {
        Self::with_levels(true, false, false, false)
    }

    /// Creates a suppressor with explicit log levels. All flags false means
    /// dropped errors are completely silent.
    pub fn with_levels(log_error: bool, log_warn: bool, log_info: bool, log_debug: bool) -> Self {
        Self {
            base: BaseProcessor::new("drop_errors"),
            log_error,
            log_warn,
            log_info,
            log_debug,
        }
    }
}

impl Default for DropErrorsProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for DropErrorsProcessor {
    fn name(&self) -> String {
        "drop_errors".into()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        if let Err(err) = self.base.forward(sample, header).await {
            if self.log_error {
                tracing::error!(error = %err, "dropped error");
            } else if self.log_warn {
                tracing::warn!(error = %err, "dropped error");
            } else if self.log_info {
                tracing::info!(error = %err, "dropped error");
            } else if self.log_debug {
                tracing::debug!(error = %err, "dropped error");
            }
        }
        Ok(())
    }
}

/// Inserts a bounded channel between its input and output, restoring
/// asynchronicity to an otherwise synchronous call chain.
///
/// The upstream blocks when the buffer is full (backpressure), the
/// downstream runs in its own task.
pub struct DecoupleProcessor {
    base: BaseProcessor,
    buffer: usize,
    tx: parking_lot::Mutex<Option<mpsc::Sender<(Sample, HeaderRef)>>>,
    rx: parking_lot::Mutex<Option<mpsc::Receiver<(Sample, HeaderRef)>>>,
    forwarder: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl DecoupleProcessor {
    /// Creates a decoupling stage with the given buffer capacity.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(1);
        // The channel exists from construction, so samples arriving before
        // the forwarder task runs are buffered rather than rejected.
        let (tx, rx) = mpsc::channel(buffer);
        Self {
            base: BaseProcessor::new("decouple"),
            buffer,
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: parking_lot::Mutex::new(Some(rx)),
            forwarder: parking_lot::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Processor for DecoupleProcessor {
    fn name(&self) -> String {
        format!("decouple(buf={})", self.buffer)
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn start(&self) -> Result<StopChan, PipelineError> {
        let mut rx = self.rx.lock().take().ok_or_else(|| {
            PipelineError::processor(self.name(), "decouple stage started twice")
        })?;

        let stop = self.base.stop_chan();
        let sink = self.base.sink();
        let handle = tokio::spawn(async move {
            while let Some((sample, header)) = rx.recv().await {
                if let Some(sink) = &sink {
                    if let Err(err) = sink.sample(sample, header).await {
                        stop.stop_err(err);
                        break;
                    }
                }
            }
        });
        *self.forwarder.lock() = Some(handle);
        Ok(self.base.stop_chan())
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        let tx = self.tx.lock().clone();
        let tx = tx.ok_or_else(|| {
            PipelineError::processor(self.name(), "decouple stage is closed")
        })?;
        tx.send((sample, header)).await.map_err(|_| {
            PipelineError::processor(self.name(), "decoupled forwarder has terminated")
        })
    }

    async fn close(&self) {
        // Dropping the sender lets the forwarder drain the buffer, then the
        // close cascades downstream from here.
        self.tx.lock().take();
        let handle = self.forwarder.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.base.close_sink().await;
    }
}

/// Joins several upstream branches into one downstream chain.
///
/// Forwards every sample unchanged; `close` cascades downstream only after
/// every upstream branch has closed, so a shared continuation is not torn
/// down while siblings still flow.
pub struct FanInProcessor {
    base: BaseProcessor,
    open_upstreams: AtomicUsize,
}

impl FanInProcessor {
    /// Creates a fan-in stage expecting `upstreams` close calls.
    pub fn new(upstreams: usize) -> Self {
        Self {
            base: BaseProcessor::new("fan_in"),
            open_upstreams: AtomicUsize::new(upstreams.max(1)),
        }
    }
}

#[async_trait]
impl Processor for FanInProcessor {
    fn name(&self) -> String {
        "fan_in".into()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        self.base.forward(sample, header).await
    }

    async fn close(&self) {
        if self.open_upstreams.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.base.close_sink().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testutil::{make_sample, CollectingSink};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_noop_forwards() {
        let noop = NoopProcessor::new();
        let sink = CollectingSink::new();
        noop.base().set_sink(sink.clone());

        let (sample, header) = make_sample(1.0);
        noop.sample(sample, header).await.unwrap();
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_drop_swallows() {
        let drop = DropProcessor::new();
        let sink = CollectingSink::new();
        drop.base().set_sink(sink.clone());

        let (sample, header) = make_sample(1.0);
        drop.sample(sample, header).await.unwrap();
        assert_eq!(sink.len(), 0);

        // Close still cascades so downstream flushes.
        drop.close().await;
        assert!(sink.was_closed());
    }

    #[tokio::test]
    async fn test_simple_processor_transforms() {
        let double = SimpleProcessor::new(
            "double",
            Box::new(|mut sample, header| {
                for value in &mut sample.values {
                    *value *= 2.0;
                }
                Ok(Some((sample, header)))
            }),
        );
        let sink = CollectingSink::new();
        double.base().set_sink(sink.clone());

        let (sample, header) = make_sample(3.0);
        double.sample(sample, header).await.unwrap();
        assert_eq!(sink.values(), vec![vec![6.0]]);
    }

    #[tokio::test]
    async fn test_simple_processor_can_drop() {
        let filter = SimpleProcessor::new("filter", Box::new(|_, _| Ok(None)));
        let sink = CollectingSink::new();
        filter.base().set_sink(sink.clone());

        let (sample, header) = make_sample(3.0);
        filter.sample(sample, header).await.unwrap();
        assert_eq!(sink.len(), 0);
    }

    struct FailingSink {
        base: BaseProcessor,
    }

    #[async_trait]
    impl Processor for FailingSink {
        fn name(&self) -> String {
            "failing".into()
        }

        fn base(&self) -> &BaseProcessor {
            &self.base
        }

        async fn sample(&self, _: Sample, _: HeaderRef) -> Result<(), PipelineError> {
            Err(PipelineError::processor("failing", "always fails"))
        }
    }

    #[tokio::test]
    async fn test_drop_errors_suppresses() {
        let suppressor = DropErrorsProcessor::new();
        suppressor.base().set_sink(Arc::new(FailingSink {
            base: BaseProcessor::new("failing"),
        }));

        let (sample, header) = make_sample(1.0);
        assert!(suppressor.sample(sample, header).await.is_ok());
    }

    #[tokio::test]
    async fn test_decouple_forwards_asynchronously() {
        let decouple = DecoupleProcessor::new(8);
        let sink = CollectingSink::new();
        decouple.base().set_sink(sink.clone());
        decouple.start().await.unwrap();

        for i in 0..5 {
            let (sample, header) = make_sample(i as f64);
            decouple.sample(sample, header).await.unwrap();
        }
        decouple.close().await;

        assert_eq!(sink.len(), 5);
        assert_eq!(
            sink.values(),
            vec![vec![0.0], vec![1.0], vec![2.0], vec![3.0], vec![4.0]]
        );
        assert!(sink.was_closed());
    }

    #[tokio::test]
    async fn test_fan_in_closes_after_last_upstream() {
        let fan_in = FanInProcessor::new(2);
        let sink = CollectingSink::new();
        fan_in.base().set_sink(sink.clone());

        fan_in.close().await;
        assert!(!sink.was_closed());
        fan_in.close().await;
        assert!(sink.was_closed());
    }
}
