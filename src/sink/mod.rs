//! Terminal sinks: processors that write samples to the outside world.
//!
//! Sinks are ordinary [`Processor`]s at the tail of a chain. They forward
//! received samples downstream unchanged (mid-pipeline outputs are legal),
//! and flush their byte streams when the close cascade reaches them.

mod file;
mod tcp;

pub use file::FileSink;
pub use tcp::{TcpListenerSink, TcpSink};

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::ParallelSampleHandler;
use crate::error::PipelineError;
use crate::marshal::Marshaller;
use crate::processor::{BaseProcessor, Processor};
use crate::sample::{HeaderRef, Sample};
use crate::stream::{SampleOutputStream, SampleWriter};
use crate::task::StopChan;

/// Slot holding the marshalling stream of a byte-writing sink.
///
/// Opened in `start`, emptied (and flushed) by `close`.
pub(crate) struct OutputSlot {
    stream: tokio::sync::Mutex<Option<SampleOutputStream>>,
}

impl OutputSlot {
    pub(crate) fn new() -> Self {
        Self {
            stream: tokio::sync::Mutex::new(None),
        }
    }

    pub(crate) async fn install(&self, stream: SampleOutputStream) {
        *self.stream.lock().await = Some(stream);
    }

    pub(crate) async fn write(
        &self,
        sample: &Sample,
        header: &HeaderRef,
        sink_name: &str,
    ) -> Result<(), PipelineError> {
        let guard = self.stream.lock().await;
        match guard.as_ref() {
            Some(stream) => stream.sample(sample, header).await,
            None => Err(PipelineError::processor(sink_name, "sink was not started")),
        }
    }

    /// Flushes and closes the stream, reporting the first error it hit.
    pub(crate) async fn close(&self) -> Result<(), PipelineError> {
        let stream = self.stream.lock().await.take();
        match stream {
            Some(stream) => stream.close().await,
            None => Ok(()),
        }
    }
}

/// Writes marshalled samples to standard output.
pub struct StdoutSink {
    base: BaseProcessor,
    marshaller: Arc<dyn Marshaller>,
    handler: ParallelSampleHandler,
    output: OutputSlot,
}

impl StdoutSink {
    /// Creates a stdout sink using the given wire format.
    pub fn new(marshaller: Arc<dyn Marshaller>, handler: ParallelSampleHandler) -> Self {
        Self {
            base: BaseProcessor::new("std://-"),
            marshaller,
            handler,
            output: OutputSlot::new(),
        }
    }
}

#[async_trait]
impl Processor for StdoutSink {
    fn name(&self) -> String {
        "std://-".into()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn start(&self) -> Result<StopChan, PipelineError> {
        let writer = SampleWriter::new(self.marshaller.clone(), self.handler.clone());
        self.output.install(writer.open(tokio::io::stdout())).await;
        Ok(self.base.stop_chan())
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        self.output.write(&sample, &header, "std://-").await?;
        self.base.forward(sample, header).await
    }

    async fn close(&self) {
        if let Err(err) = self.output.close().await {
            self.base.error(err);
        }
        self.base.close_sink().await;
    }
}
