//! Fork/merge subsystem: dynamic sub-pipeline routing.
//!
//! A [`Fork`] asks its [`Distributor`] which sub-pipelines should receive
//! each sample, instantiates missing sub-pipelines from their
//! [`PipelineTemplate`]s on first use, and funnels every branch's output
//! through its [`Merger`] back into the fork's downstream sink.
//!
//! When a sample matches several branches, each branch receives an
//! independent clone, so mutation in one branch cannot corrupt another.

mod distributor;

pub use distributor::{Distributor, MultiplexDistributor, RoundRobinDistributor, TagDistributor};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::event::{EventCallback, PipelineEvent};
use crate::pipeline::SamplePipeline;
use crate::processor::{fan_out, BaseProcessor, Processor};
use crate::sample::{HeaderRef, Sample};
use crate::task::TaskGroup;

/// Ordered list of keys identifying a sub-pipeline's position in nested
/// forks. Set before any sample reaches the sub-pipeline, never mutated
/// afterwards.
pub type ForkPath = Vec<String>;

/// A buildable sub-pipeline blueprint with a stable identity.
///
/// The fork's sub-pipeline cache is keyed by the template id, so two keys
/// selecting the same template share one running sub-pipeline.
pub struct PipelineTemplate {
    id: usize,
    factory: Box<dyn Fn() -> Result<SamplePipeline, PipelineError> + Send + Sync>,
}

impl PipelineTemplate {
    /// Creates a template. Ids are assigned by the builder, unique within
    /// one pipeline graph.
    pub fn new(
        id: usize,
        factory: Box<dyn Fn() -> Result<SamplePipeline, PipelineError> + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self { id, factory })
    }

    /// The stable identity of this template.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Builds a fresh sub-pipeline from this template.
    pub fn build(&self) -> Result<SamplePipeline, PipelineError> {
        (self.factory)()
    }
}

/// One delivery decision of a distributor: which template, under which key.
pub struct ForkTarget {
    /// The routing key (tag value, round-robin slot, ...).
    pub key: String,
    /// The sub-pipeline blueprint handling this key.
    pub template: Arc<PipelineTemplate>,
}

/// A running sub-pipeline in the fork's cache.
struct RunningSubpipeline {
    key: String,
    entry: Arc<dyn Processor>,
}

type SubpipelineCache = Arc<tokio::sync::Mutex<HashMap<usize, RunningSubpipeline>>>;

/// The sink end of a fork: forwards every sample of every branch to the
/// fork's outgoing sink.
///
/// Its `close` is a no-op; the owning fork closes the downstream chain
/// once *all* branches have closed, not when the first one does.
pub struct Merger {
    base: BaseProcessor,
}

impl Merger {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            base: BaseProcessor::new("merger"),
        })
    }

    fn set_outgoing(&self, sink: Arc<dyn Processor>) {
        self.base.set_sink(sink);
    }
}

#[async_trait]
impl Processor for Merger {
    fn name(&self) -> String {
        "merger".into()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        self.base.forward(sample, header).await
    }

    async fn close(&self) {
        // Branch closes stop here; the fork closes downstream itself.
    }

    fn merger_original_sink(&self) -> Option<Arc<dyn Processor>> {
        self.base.sink()
    }
}

/// Routes samples into dynamically instantiated sub-pipelines.
pub struct Fork {
    base: BaseProcessor,
    distributor: Box<dyn Distributor>,
    nonfatal_errors: bool,
    fork_path: parking_lot::Mutex<ForkPath>,
    merger: Arc<Merger>,
    cache: SubpipelineCache,
    shutdown_timeout: Duration,
    event_callback: Option<EventCallback>,
}

impl Fork {
    /// Creates a fork around the given distributor policy.
    pub fn new(distributor: Box<dyn Distributor>, config: &PipelineConfig) -> Self {
        Self {
            base: BaseProcessor::new(distributor.name()),
            distributor,
            nonfatal_errors: false,
            fork_path: parking_lot::Mutex::new(Vec::new()),
            merger: Merger::new(),
            cache: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            shutdown_timeout: config.shutdown_timeout,
            event_callback: None,
        }
    }

    /// Makes sub-pipeline failures non-fatal: the failed sub-pipeline is
    /// logged and removed from the cache, the fork keeps running.
    pub fn with_nonfatal_errors(mut self, nonfatal: bool) -> Self {
        self.nonfatal_errors = nonfatal;
        self
    }

    /// Sets a callback receiving sub-pipeline lifecycle events.
    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.event_callback = Some(callback);
        self
    }

    /// The fork path assigned to this fork by its parent, empty at top
    /// level.
    pub fn fork_path(&self) -> ForkPath {
        self.fork_path.lock().clone()
    }

    /// Resolves the running sub-pipeline for a target, instantiating it on
    /// first use. The cache is only touched under the fork's lock.
    async fn sub_pipeline_entry(
        &self,
        cache: &mut HashMap<usize, RunningSubpipeline>,
        target: &ForkTarget,
    ) -> Result<Arc<dyn Processor>, PipelineError> {
        if let Some(running) = cache.get(&target.template.id()) {
            if running.key != target.key {
                tracing::debug!(
                    key = %target.key,
                    started_for = %running.key,
                    "sub-pipeline reused across keys"
                );
            }
            return Ok(running.entry.clone());
        }

        let entry = self.instantiate(target).await?;
        cache.insert(
            target.template.id(),
            RunningSubpipeline {
                key: target.key.clone(),
                entry: entry.clone(),
            },
        );
        Ok(entry)
    }

    async fn instantiate(&self, target: &ForkTarget) -> Result<Arc<dyn Processor>, PipelineError> {
        let mut pipe = target.template.build()?;

        let mut path = self.fork_path.lock().clone();
        path.push(target.key.clone());
        tracing::debug!(path = ?path, "starting forked sub-pipeline");

        // Sub-pipelines receive samples from the fork, not from a source
        // of their own.
        let ignored = pipe.take_sources();
        if !ignored.is_empty() {
            tracing::warn!(
                path = ?path,
                "ignoring configured source of forked sub-pipeline"
            );
        }
        for processor in pipe.processors() {
            processor.set_fork_path(&path);
        }

        // The branch ends in the merger, unless a remapper downstream
        // claims this fork path. A trailing nested fork resolves its own
        // terminal instead.
        let ends_in_fork = pipe.last_processor().map_or(false, |last| last.is_fork());
        let terminal: Arc<dyn Processor> = if ends_in_fork {
            self.merger.clone()
        } else {
            match probe_remapped(self.base.sink(), &path) {
                Some(remapped) => remapped,
                None => self.merger.clone(),
            }
        };
        pipe.add(terminal);

        let group = TaskGroup::new(self.shutdown_timeout);
        pipe.construct(&group)?;
        let entry = pipe
            .first_processor()
            .ok_or_else(|| PipelineError::Config("forked sub-pipeline is empty".into()))?;

        // Start the sub-pipeline before the first sample flows into it;
        // only the supervision runs in the background.
        let running = group.start_tasks().await?;
        self.supervise(running, path);
        Ok(entry)
    }

    /// Supervises a started sub-pipeline in the background and applies
    /// the failure policy when it terminates.
    fn supervise(&self, running: crate::task::RunningGroup, path: ForkPath) {
        let nonfatal = self.nonfatal_errors;
        let cache = self.cache.clone();
        let fork_stop = self.base.stop_chan();
        let events = self.event_callback.clone();

        tokio::spawn(async move {
            let errors = running.run_to_completion(false).await;
            let error_text = (!errors.is_empty()).then(|| errors.to_string());
            if let Some(callback) = &events {
                callback(PipelineEvent::SubpipelineFinished {
                    path: path.clone(),
                    error: error_text.clone(),
                });
            }
            match errors.into_result() {
                Ok(()) => {
                    tracing::debug!(path = ?path, "sub-pipeline finished");
                }
                Err(err) if nonfatal => {
                    tracing::error!(path = ?path, error = %err, "sub-pipeline failed, removed");
                    let key = path.last().cloned().unwrap_or_default();
                    cache.lock().await.retain(|_, running| running.key != key);
                }
                Err(err) => fork_stop.stop_err(err),
            }
        });
    }
}

#[async_trait]
impl Processor for Fork {
    fn name(&self) -> String {
        self.base.name().to_string()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn start(&self) -> Result<crate::task::StopChan, PipelineError> {
        if let Some(sink) = self.base.sink() {
            self.merger.set_outgoing(sink);
        }
        Ok(self.base.stop_chan())
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        let targets = self.distributor.distribute(&sample, &header)?;
        let mut sinks = Vec::with_capacity(targets.len());
        {
            let mut cache = self.cache.lock().await;
            for target in &targets {
                sinks.push(self.sub_pipeline_entry(&mut cache, target).await?);
            }
        }
        match sinks.len() {
            0 => Ok(()),
            1 => sinks[0].sample(sample, header).await,
            _ => fan_out(&sinks, sample, header).await,
        }
    }

    async fn close(&self) {
        // Close every branch first; each cascade flushes into the merger
        // and stops there. Only then does the fork close downstream.
        let entries: Vec<Arc<dyn Processor>> = {
            let mut cache = self.cache.lock().await;
            cache.drain().map(|(_, running)| running.entry).collect()
        };
        for entry in entries {
            entry.close().await;
        }
        // All branches are flushed; release the sub-pipeline supervisors
        // waiting on the shared merger.
        self.merger.base.stop_chan().stop();
        self.base.close_sink().await;
    }

    fn is_fork(&self) -> bool {
        true
    }

    fn set_fork_path(&self, path: &[String]) {
        *self.fork_path.lock() = path.to_vec();
    }
}

/// Walks merger layers downstream of a fork looking for a remapper that
/// claims the given fork path.
fn probe_remapped(
    outgoing: Option<Arc<dyn Processor>>,
    path: &[String],
) -> Option<Arc<dyn Processor>> {
    let mut current = outgoing?;
    loop {
        if let Some(remapped) = current.remapped_sink(path) {
            return Some(remapped);
        }
        current = current.merger_original_sink()?;
    }
}

/// Re-routes merged fork output back into per-key sub-pipelines.
///
/// Placed downstream of a fork, a remapper claims fork paths whose last
/// key matches one of its patterns (`*` is the fallback): the fork binds
/// those branches directly to a remapper-owned sub-pipeline instead of the
/// fork's merger. Samples reaching the remapper through the ordinary chain
/// pass through unchanged.
pub struct ForkRemapper {
    base: BaseProcessor,
    mapping: Vec<(String, Arc<PipelineTemplate>)>,
    cache: parking_lot::Mutex<HashMap<usize, RunningSubpipeline>>,
    merger: Arc<Merger>,
    shutdown_timeout: Duration,
}

impl ForkRemapper {
    /// Creates a remapper with a pattern-to-template map.
    pub fn new(mapping: Vec<(String, Arc<PipelineTemplate>)>, config: &PipelineConfig) -> Self {
        Self {
            base: BaseProcessor::new("remap"),
            mapping,
            cache: parking_lot::Mutex::new(HashMap::new()),
            merger: Merger::new(),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    fn template_for(&self, key: &str) -> Option<&Arc<PipelineTemplate>> {
        self.mapping
            .iter()
            .find(|(pattern, _)| pattern == key)
            .or_else(|| self.mapping.iter().find(|(pattern, _)| pattern == "*"))
            .map(|(_, template)| template)
    }
}

#[async_trait]
impl Processor for ForkRemapper {
    fn name(&self) -> String {
        "remap".into()
    }

    fn base(&self) -> &BaseProcessor {
        &self.base
    }

    async fn start(&self) -> Result<crate::task::StopChan, PipelineError> {
        if let Some(sink) = self.base.sink() {
            self.merger.set_outgoing(sink);
        }
        Ok(self.base.stop_chan())
    }

    async fn sample(&self, sample: Sample, header: HeaderRef) -> Result<(), PipelineError> {
        self.base.forward(sample, header).await
    }

    async fn close(&self) {
        let entries: Vec<Arc<dyn Processor>> = {
            let mut cache = self.cache.lock();
            cache.drain().map(|(_, running)| running.entry).collect()
        };
        for entry in entries {
            entry.close().await;
        }
        self.merger.base.stop_chan().stop();
        self.base.close_sink().await;
    }

    fn remapped_sink(&self, path: &[String]) -> Option<Arc<dyn Processor>> {
        let key = path.last()?;
        let template = self.template_for(key)?.clone();

        let mut cache = self.cache.lock();
        if let Some(running) = cache.get(&template.id()) {
            return Some(running.entry.clone());
        }

        let mut pipe = match template.build() {
            Ok(pipe) => pipe,
            Err(err) => {
                tracing::error!(path = ?path, error = %err, "cannot build remapped sub-pipeline");
                return None;
            }
        };
        let ignored = pipe.take_sources();
        if !ignored.is_empty() {
            tracing::warn!(path = ?path, "ignoring configured source of remapped sub-pipeline");
        }
        pipe.add(self.merger.clone());

        let group = TaskGroup::new(self.shutdown_timeout);
        if let Err(err) = pipe.construct(&group) {
            tracing::error!(path = ?path, error = %err, "cannot construct remapped sub-pipeline");
            return None;
        }
        let entry = pipe.first_processor()?;
        tokio::spawn(async move {
            let errors = group.run().await;
            if !errors.is_empty() {
                tracing::error!(errors = errors.len(), "remapped sub-pipeline failed");
            }
        });

        cache.insert(
            template.id(),
            RunningSubpipeline {
                key: key.clone(),
                entry: entry.clone(),
            },
        );
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testutil::{make_sample, CollectingSink};
    use crate::processor::SimpleProcessor;

    fn config() -> PipelineConfig {
        PipelineConfig::default()
    }

    #[tokio::test]
    async fn test_multiplex_fork_delivers_clones() {
        let left = CollectingSink::new();
        let right = CollectingSink::new();

        let make_branch = |sink: Arc<CollectingSink>, factor: f64| {
            Box::new(move || {
                let mut pipe = SamplePipeline::new();
                let sink = sink.clone();
                pipe.add(Arc::new(SimpleProcessor::new(
                    "scale",
                    Box::new(move |mut sample, header| {
                        for value in &mut sample.values {
                            *value *= factor;
                        }
                        Ok(Some((sample, header)))
                    }),
                )));
                pipe.add(sink.clone());
                Ok(pipe)
            }) as Box<dyn Fn() -> Result<SamplePipeline, PipelineError> + Send + Sync>
        };

        let templates = vec![
            ("0".to_string(), PipelineTemplate::new(0, make_branch(left.clone(), 2.0))),
            ("1".to_string(), PipelineTemplate::new(1, make_branch(right.clone(), 10.0))),
        ];
        let fork = Fork::new(Box::new(MultiplexDistributor::new(templates)), &config());
        let downstream = CollectingSink::new();
        fork.base().set_sink(downstream.clone());
        fork.start().await.unwrap();

        let (sample, header) = make_sample(3.0);
        fork.sample(sample, header).await.unwrap();

        // Each branch mutated its own clone.
        assert_eq!(left.values(), vec![vec![6.0]]);
        assert_eq!(right.values(), vec![vec![30.0]]);
        // Both branches forwarded into the merger and thus downstream.
        assert_eq!(downstream.len(), 2);

        fork.close().await;
        assert!(left.was_closed());
        assert!(right.was_closed());
        assert!(downstream.was_closed());
    }

    #[tokio::test]
    async fn test_fork_caches_sub_pipelines() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let builds = counter.clone();
        let template = PipelineTemplate::new(
            7,
            Box::new(move || {
                builds.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let mut pipe = SamplePipeline::new();
                pipe.add(Arc::new(crate::processor::NoopProcessor::new()));
                Ok(pipe)
            }),
        );
        let fork = Fork::new(
            Box::new(TagDistributor::new("role", vec![("*".into(), template)])),
            &config(),
        );
        fork.start().await.unwrap();

        for role in ["web", "db", "web"] {
            let (mut sample, header) = make_sample(1.0);
            sample.set_tag("role", role);
            fork.sample(sample, header).await.unwrap();
        }

        // One shared template: instantiated once, reused for both keys.
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
        fork.close().await;
    }

    #[tokio::test]
    async fn test_merger_close_does_not_cascade() {
        let downstream = CollectingSink::new();
        let merger = Merger::new();
        merger.set_outgoing(downstream.clone());

        merger.close().await;
        assert!(!downstream.was_closed());
    }

    #[tokio::test]
    async fn test_fork_path_assigned_to_nested_forks() {
        let inner_template = PipelineTemplate::new(
            1,
            Box::new(|| {
                let mut pipe = SamplePipeline::new();
                pipe.add(Arc::new(crate::processor::NoopProcessor::new()));
                Ok(pipe)
            }),
        );
        let nested = Arc::new(Fork::new(
            Box::new(TagDistributor::new(
                "inner",
                vec![("*".into(), inner_template)],
            )),
            &config(),
        ));

        let nested_probe = nested.clone();
        let outer_template = PipelineTemplate::new(
            2,
            Box::new(move || {
                let mut pipe = SamplePipeline::new();
                pipe.add(nested_probe.clone());
                Ok(pipe)
            }),
        );
        let outer = Fork::new(
            Box::new(TagDistributor::new(
                "role",
                vec![("*".into(), outer_template)],
            )),
            &config(),
        );
        outer.start().await.unwrap();

        let (mut sample, header) = make_sample(1.0);
        sample.set_tag("role", "web");
        outer.sample(sample, header).await.unwrap();

        assert_eq!(nested.fork_path(), vec!["web".to_string()]);
        outer.close().await;
    }
}
