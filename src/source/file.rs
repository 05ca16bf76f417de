//! File-based sample source.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ParallelSampleHandler;
use crate::error::PipelineError;
use crate::marshal::Marshaller;
use crate::processor::{BaseProcessor, Processor};
use crate::sample::{HeaderRef, Sample};
use crate::stream::SampleReader;
use crate::task::StopChan;

use super::{BaseSource, SampleSource};

/// Reads a list of files in order and decodes their samples.
///
/// With [`with_file_tag`](FileSource::with_file_tag), every sample is
/// stamped with the name of the file it came from, so downstream steps can
/// detect file boundaries.
pub struct FileSource {
    base: Arc<BaseSource>,
    files: Vec<PathBuf>,
    file_tag: Option<String>,
    marshaller: Arc<dyn Marshaller>,
    handler: ParallelSampleHandler,
}

impl FileSource {
    /// Creates a source reading the given files in order.
    pub fn new(
        files: Vec<PathBuf>,
        marshaller: Arc<dyn Marshaller>,
        handler: ParallelSampleHandler,
    ) -> Self {
        let name = match files.as_slice() {
            [single] => format!("file://{}", single.display()),
            many => format!("file://[{} files]", many.len()),
        };
        Self {
            base: BaseSource::new(name),
            files,
            file_tag: None,
            marshaller,
            handler,
        }
    }

    /// Stamps each sample with the originating file name under this tag.
    pub fn with_file_tag(mut self, tag: impl Into<String>) -> Self {
        self.file_tag = Some(tag.into());
        self
    }
}

#[async_trait]
impl SampleSource for FileSource {
    fn name(&self) -> String {
        self.base.name().to_string()
    }

    fn set_sink(&self, sink: Arc<dyn Processor>) {
        self.base.set_sink(sink);
    }

    async fn start(&self) -> Result<StopChan, PipelineError> {
        let sink = self.base.sink()?;
        let files = self.files.clone();
        let file_tag = self.file_tag.clone();
        let marshaller = self.marshaller.clone();
        let handler = self.handler.clone();
        let cancel = self.base.cancel_chan();

        self.base.spawn_producer(async move {
            for path in files {
                if cancel.is_stopped() {
                    break;
                }
                let file = tokio::fs::File::open(&path).await.map_err(|err| {
                    PipelineError::endpoint(path.display().to_string(), err)
                })?;

                let conn_sink: Arc<dyn Processor> = match &file_tag {
                    Some(tag) => Arc::new(TagInjector::new(
                        tag.clone(),
                        path.display().to_string(),
                        sink.clone(),
                    )),
                    None => sink.clone(),
                };
                let reader = SampleReader::new(marshaller.clone(), handler.clone());
                let count = reader
                    .read_stream(tokio::io::BufReader::new(file), conn_sink, cancel.clone())
                    .await?;
                tracing::debug!(file = %path.display(), samples = count, "file read");
            }
            Ok(())
        });
        Ok(self.base.done())
    }

    fn stop(&self) {
        self.base.request_stop();
    }
}

/// Sets a fixed tag on every passing sample. Sits between a per-file read
/// stream and the real chain, outside the close cascade.
struct TagInjector {
    base: BaseProcessor,
    key: String,
    value: String,
}

impl TagInjector {
    fn new(key: String, value: String, sink: Arc<dyn Processor>) -> Self {
        let base = BaseProcessor::new("tag_injector");
        base.set_sink(sink);
        Self { base, key, value }
    }
}

#[async_trait]
impl Processor for TagInjector {
    fn name(&self) -> String {
        "tag_injector".into()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn sample(&self, mut sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        sample.set_tag(self.key.clone(), self.value.clone());
        self.base.forward(sample, header).await
    }

    async fn close(&self) {
        // The owning source closes the real chain; a per-file wrapper must
        // not cascade.
    }
}
