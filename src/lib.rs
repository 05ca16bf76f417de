//! # bitflow
//!
//! A streaming engine for timestamped sample vectors. Users describe a
//! flow as a short script; the engine parses it, instantiates a pipeline
//! of concurrent stages and drives samples from sources through
//! transforms, forks and merges to sinks.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bitflow::{run_pipelines, EndpointFactory, PipelineConfig, Registry, ScriptBuilder};
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::default();
//! let registry = Arc::new(Registry::with_builtins());
//! let endpoints = Arc::new(EndpointFactory::new(config.clone()));
//!
//! let builder = ScriptBuilder::new(registry, endpoints);
//! let pipelines = builder.build_script("data.csv -> noop() -> listen://:7878")?;
//!
//! let exit_code = run_pipelines(pipelines, &config, true).await;
//! ```
//!
//! ## Architecture
//!
//! Samples flow through a chain of [`Processor`]s wired sink-to-sink:
//!
//! - **Sources** decode byte streams (files, TCP, stdin) through a
//!   parallel unmarshalling stream that keeps wire order intact
//! - **Processors** receive one sample at a time and forward any number
//!   downstream; forks route samples into dynamically instantiated
//!   sub-pipelines and merge their outputs back
//! - **Sinks** marshal samples back to bytes; a TCP listener sink serves
//!   any number of readers and disconnects the ones that stall
//!
//! A [`TaskGroup`] supervises all stages: the first termination (or an
//! interrupt) broadcasts a stop, EOF cascades an orderly `close()` from
//! each source through its chain, and all errors are aggregated into the
//! process exit code.

mod config;
mod endpoint;
mod error;
mod event;
mod fork;
mod marshal;
mod pipeline;
mod processor;
mod registry;
mod sample;
mod sink;
mod source;
mod stream;
mod task;

pub mod script;

pub use config::{ParallelSampleHandler, PipelineConfig};
pub use endpoint::{Endpoint, EndpointFactory, EndpointType};
pub use error::{MarshalError, MultiError, PipelineError};
pub use event::{event_callback, EventCallback, PipelineEvent};
pub use fork::{
    Distributor, Fork, ForkPath, ForkRemapper, ForkTarget, Merger, MultiplexDistributor,
    PipelineTemplate, RoundRobinDistributor, TagDistributor,
};
pub use marshal::{BinaryMarshaller, CsvMarshaller, Format, Marshaller};
pub use pipeline::{run_pipelines, SamplePipeline};
pub use processor::{
    BaseProcessor, BatchProcessor, BatchStep, BatchTrigger, DecoupleProcessor,
    DropErrorsProcessor, DropProcessor, FanInProcessor, NoopProcessor, ProcessFn, Processor,
    SimpleProcessor,
};
pub use registry::{bool_param, int_param, ForkSubpipelines, Registry, RegisteredStep, StepParams};
pub use sample::{
    format_time, parse_tags, parse_time, Header, HeaderRef, Sample, TagMap, TAGS_COLUMN,
    TIME_COLUMN,
};
pub use script::ScriptBuilder;
pub use sink::{FileSink, StdoutSink, TcpListenerSink, TcpSink};
pub use source::{
    BaseSource, EmptySource, FileSource, SampleSource, StdinSource, TcpListenerSource, TcpSource,
};
pub use stream::{SampleOutputStream, SampleReader, SampleWriter};
pub use task::{RunningGroup, StopChan, Task, TaskGroup};
