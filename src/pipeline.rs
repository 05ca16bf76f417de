//! Linear pipeline composition and wiring.
//!
//! A [`SamplePipeline`] is an ordered chain: sources feeding a list of
//! processors, the last of which is usually a terminal sink. `construct`
//! wires each stage's sink to its successor and registers every stage as a
//! task with the supervising [`TaskGroup`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::processor::{DropProcessor, FanInProcessor, Processor};
use crate::source::SampleSource;
use crate::task::{StopChan, Task, TaskGroup};

/// An ordered chain of sources and processors.
pub struct SamplePipeline {
    sources: Vec<Arc<dyn SampleSource>>,
    processors: Vec<Arc<dyn Processor>>,
}

impl SamplePipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            processors: Vec::new(),
        }
    }

    /// Appends a source. Several sources feed the chain concurrently.
    pub fn add_source(&mut self, source: Arc<dyn SampleSource>) -> &mut Self {
        self.sources.push(source);
        self
    }

    /// Appends a processor.
    ///
    /// The previous processor gets a chance to fuse with the new one via
    /// [`Processor::merge_with`]; on success the new instance is discarded.
    pub fn add(&mut self, processor: Arc<dyn Processor>) -> &mut Self {
        if let Some(last) = self.processors.last() {
            if last.merge_with(&processor) {
                return self;
            }
        }
        self.processors.push(processor);
        self
    }

    /// The configured sources.
    pub fn sources(&self) -> &[Arc<dyn SampleSource>] {
        &self.sources
    }

    /// The configured processors, in chain order.
    pub fn processors(&self) -> &[Arc<dyn Processor>] {
        &self.processors
    }

    /// Removes and returns all sources. Used by forks, whose sub-pipelines
    /// receive their input from the parent instead.
    pub fn take_sources(&mut self) -> Vec<Arc<dyn SampleSource>> {
        std::mem::take(&mut self.sources)
    }

    /// The entry processor of the chain, if any.
    pub fn first_processor(&self) -> Option<Arc<dyn Processor>> {
        self.processors.first().cloned()
    }

    /// The terminal processor of the chain, if any.
    pub fn last_processor(&self) -> Option<Arc<dyn Processor>> {
        self.processors.last().cloned()
    }

    /// Wires neighbors and registers every stage with the task group.
    ///
    /// Each processor's sink becomes the next processor. A pipeline without
    /// processors gets a terminal [`DropProcessor`] so sources always have
    /// a sink. With several sources, a fan-in stage is inserted so the
    /// chain is closed exactly once, after the last source finished.
    pub fn construct(&mut self, group: &TaskGroup) -> Result<(), PipelineError> {
        if self.processors.is_empty() {
            self.processors.push(Arc::new(DropProcessor::new()));
        }
        for pair in self.processors.windows(2) {
            pair[0].base().set_sink(pair[1].clone());
        }

        let mut entry = match self.first_processor() {
            Some(entry) => entry,
            None => return Err(PipelineError::Config("empty pipeline".into())),
        };
        if self.sources.len() > 1 {
            let fan_in: Arc<dyn Processor> = Arc::new(FanInProcessor::new(self.sources.len()));
            fan_in.base().set_sink(entry);
            self.processors.insert(0, fan_in.clone());
            entry = fan_in;
        }
        for source in &self.sources {
            source.set_sink(entry.clone());
        }

        for source in &self.sources {
            group.add(Arc::new(SourceTask(source.clone())));
        }
        for processor in &self.processors {
            group.add(Arc::new(ProcessorTask(processor.clone())));
        }
        Ok(())
    }

    /// Renders the pipeline as one line per stage, for `-print-pipeline`.
    pub fn format_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for source in &self.sources {
            lines.push(format!("Source: {}", source.name()));
        }
        if self.sources.is_empty() {
            lines.push("Source: none".to_string());
        }
        for processor in &self.processors {
            lines.push(format!("├─ {}", processor.name()));
        }
        lines
    }
}

impl Default for SamplePipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapts a source to the task group. `stop` requests the source to
/// unwind, which runs the close cascade before the task reports done.
struct SourceTask(Arc<dyn SampleSource>);

#[async_trait]
impl Task for SourceTask {
    fn name(&self) -> String {
        self.0.name()
    }

    async fn start(&self) -> Result<StopChan, PipelineError> {
        self.0.start().await
    }

    fn stop(&self) {
        self.0.stop();
    }
}

/// Adapts a processor to the task group. `stop` is deliberately a no-op:
/// processors terminate through the close cascade driven by their source,
/// which keeps shutdown ordered upstream-to-downstream.
struct ProcessorTask(Arc<dyn Processor>);

#[async_trait]
impl Task for ProcessorTask {
    fn name(&self) -> String {
        self.0.name()
    }

    async fn start(&self) -> Result<StopChan, PipelineError> {
        self.0.start().await
    }

    fn stop(&self) {}
}

/// Constructs all pipelines into one task group and runs it.
///
/// Returns the number of errors, which is the intended process exit code.
pub async fn run_pipelines(
    pipelines: Vec<SamplePipeline>,
    config: &PipelineConfig,
    with_signal: bool,
) -> usize {
    let group = TaskGroup::new(config.shutdown_timeout);
    for mut pipeline in pipelines {
        if let Err(err) = pipeline.construct(&group) {
            tracing::error!(error = %err, "cannot construct pipeline");
            return 1;
        }
    }
    let errors = if with_signal {
        group.run_with_signal().await
    } else {
        group.run().await
    };
    errors.len()
}
