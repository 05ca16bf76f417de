//! Registry of pipeline steps available to scripts.
//!
//! The registry is an explicit object built by the host and threaded
//! through the script builder; there is no global registration. Each entry
//! carries a description and its parameter names, so the registry doubles
//! as the data behind `-print-analyses` and `-capabilities`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::fork::{Fork, PipelineTemplate, RoundRobinDistributor, TagDistributor};
use crate::processor::{DecoupleProcessor, DropErrorsProcessor, DropProcessor, NoopProcessor, Processor};

/// Parameters of one script step, as written: `name(key=value, ...)`.
pub type StepParams = HashMap<String, String>;

/// Sub-pipelines of a fork step: script key plus buildable template.
pub type ForkSubpipelines = Vec<(String, Arc<PipelineTemplate>)>;

type TransformFn = Box<
    dyn Fn(&StepParams, &PipelineConfig) -> Result<Arc<dyn Processor>, PipelineError>
        + Send
        + Sync,
>;
type ForkFn = Box<
    dyn Fn(&StepParams, ForkSubpipelines, &PipelineConfig) -> Result<Arc<dyn Processor>, PipelineError>
        + Send
        + Sync,
>;

enum StepConstructor {
    Transform(TransformFn),
    Fork(ForkFn),
}

/// One registered step.
pub struct RegisteredStep {
    name: String,
    description: String,
    required_params: Vec<String>,
    optional_params: Vec<String>,
    constructor: StepConstructor,
}

impl RegisteredStep {
    /// The step name scripts refer to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether this step hosts sub-pipelines.
    pub fn is_fork(&self) -> bool {
        matches!(self.constructor, StepConstructor::Fork(_))
    }

    /// Validates written parameters against the declared names.
    pub fn validate_params(&self, params: &StepParams) -> Result<(), PipelineError> {
        for key in params.keys() {
            if !self.required_params.contains(key) && !self.optional_params.contains(key) {
                return Err(PipelineError::InvalidStepParams {
                    step: self.name.clone(),
                    reason: format!("unknown parameter '{key}'"),
                });
            }
        }
        for required in &self.required_params {
            if !params.contains_key(required) {
                return Err(PipelineError::InvalidStepParams {
                    step: self.name.clone(),
                    reason: format!("missing required parameter '{required}'"),
                });
            }
        }
        Ok(())
    }

    /// Builds the transform this step describes.
    pub fn build_transform(
        &self,
        params: &StepParams,
        config: &PipelineConfig,
    ) -> Result<Arc<dyn Processor>, PipelineError> {
        match &self.constructor {
            StepConstructor::Transform(f) => f(params, config),
            StepConstructor::Fork(_) => Err(PipelineError::InvalidStepParams {
                step: self.name.clone(),
                reason: "fork step used without sub-pipelines".into(),
            }),
        }
    }

    /// Builds the fork this step describes over the given sub-pipelines.
    pub fn build_fork(
        &self,
        params: &StepParams,
        subpipelines: ForkSubpipelines,
        config: &PipelineConfig,
    ) -> Result<Arc<dyn Processor>, PipelineError> {
        match &self.constructor {
            StepConstructor::Fork(f) => f(params, subpipelines, config),
            StepConstructor::Transform(_) => Err(PipelineError::InvalidStepParams {
                step: self.name.clone(),
                reason: "step does not accept sub-pipelines".into(),
            }),
        }
    }
}

/// JSON view of one registered step, for `-capabilities`.
#[derive(Serialize)]
struct Capability<'a> {
    name: &'a str,
    description: &'a str,
    is_fork: bool,
    required_params: &'a [String],
    optional_params: &'a [String],
}

/// The set of steps a script may use.
pub struct Registry {
    steps: BTreeMap<String, RegisteredStep>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            steps: BTreeMap::new(),
        }
    }

    /// Creates a registry with all generic built-in steps.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtins();
        registry
    }

    /// Registers a transform step.
    pub fn register_transform(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        required_params: &[&str],
        optional_params: &[&str],
        constructor: TransformFn,
    ) {
        let name = name.into();
        self.steps.insert(
            name.clone(),
            RegisteredStep {
                name,
                description: description.into(),
                required_params: to_strings(required_params),
                optional_params: to_strings(optional_params),
                constructor: StepConstructor::Transform(constructor),
            },
        );
    }

    /// Registers a fork step.
    pub fn register_fork(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        required_params: &[&str],
        optional_params: &[&str],
        constructor: ForkFn,
    ) {
        let name = name.into();
        self.steps.insert(
            name.clone(),
            RegisteredStep {
                name,
                description: description.into(),
                required_params: to_strings(required_params),
                optional_params: to_strings(optional_params),
                constructor: StepConstructor::Fork(constructor),
            },
        );
    }

    /// Looks up a step by name.
    pub fn get(&self, name: &str) -> Option<&RegisteredStep> {
        self.steps.get(name)
    }

    /// Returns `true` when the step is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// One line per step, sorted by name, for `-print-analyses`.
    pub fn print_analyses(&self) -> String {
        self.steps
            .values()
            .map(|step| format!(" - {}: {}", step.name, step.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The registry as JSON, for `-capabilities`.
    pub fn capabilities_json(&self) -> serde_json::Value {
        let capabilities: Vec<Capability<'_>> = self
            .steps
            .values()
            .map(|step| Capability {
                name: &step.name,
                description: &step.description,
                is_fork: step.is_fork(),
                required_params: &step.required_params,
                optional_params: &step.optional_params,
            })
            .collect();
        serde_json::json!(capabilities)
    }

    /// Registers the generic built-in steps.
    pub fn register_builtins(&mut self) {
        self.register_transform(
            "noop",
            "Forward all samples unchanged.",
            &[],
            &[],
            Box::new(|_, _| Ok(Arc::new(NoopProcessor::new()))),
        );
        self.register_transform(
            "drop",
            "Discard all samples.",
            &[],
            &[],
            Box::new(|_, _| Ok(Arc::new(DropProcessor::new()))),
        );
        self.register_transform(
            "drop_errors",
            "Log errors of subsequent steps instead of propagating them.",
            &[],
            &["log", "log-warn", "log-info", "log-debug"],
            Box::new(|params, _| {
                let log_debug = bool_param(params, "log-debug", false)?;
                let log_info = bool_param(params, "log-info", false)?;
                let log_warn = bool_param(params, "log-warn", false)?;
                // Error-level logging is the default unless another level
                // was picked.
                let log_error =
                    bool_param(params, "log", !(log_debug || log_info || log_warn))?;
                Ok(Arc::new(DropErrorsProcessor::with_levels(
                    log_error, log_warn, log_info, log_debug,
                )))
            }),
        );
        self.register_transform(
            "decouple",
            "Buffer samples in a bounded channel, decoupling the downstream steps.",
            &[],
            &["buf"],
            Box::new(|params, _| {
                let buffer = int_param(params, "buf", 1000)?;
                Ok(Arc::new(DecoupleProcessor::new(buffer)))
            }),
        );
        self.register_fork(
            "fork_tags",
            "Route samples into sub-pipelines keyed by a tag value ('*' matches the rest).",
            &["tag"],
            &["split"],
            Box::new(|params, subpipelines, config| {
                let tag = params.get("tag").cloned().unwrap_or_default();
                let mut distributor = TagDistributor::new(tag, subpipelines);
                if let Some(separator) = params.get("split") {
                    distributor = distributor.with_split(separator.clone());
                }
                Ok(Arc::new(build_fork(Box::new(distributor), params, config)?))
            }),
        );
        self.register_fork(
            "rr",
            "Cycle samples across the sub-pipelines round-robin.",
            &[],
            &["nonfatal"],
            Box::new(|params, subpipelines, config| {
                let distributor = RoundRobinDistributor::new(subpipelines);
                Ok(Arc::new(build_fork(Box::new(distributor), params, config)?))
            }),
        );
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn build_fork(
    distributor: Box<dyn crate::fork::Distributor>,
    params: &StepParams,
    config: &PipelineConfig,
) -> Result<Fork, PipelineError> {
    let nonfatal = bool_param(params, "nonfatal", false)?;
    Ok(Fork::new(distributor, config).with_nonfatal_errors(nonfatal))
}

fn to_strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Parses an optional boolean step parameter.
pub fn bool_param(params: &StepParams, name: &str, default: bool) -> Result<bool, PipelineError> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| PipelineError::InvalidStepParams {
            step: name.to_string(),
            reason: format!("'{raw}' is not a boolean"),
        }),
    }
}

/// Parses an optional integer step parameter.
pub fn int_param(params: &StepParams, name: &str, default: usize) -> Result<usize, PipelineError> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| PipelineError::InvalidStepParams {
            step: name.to_string(),
            reason: format!("'{raw}' is not an integer"),
        }),
    }
}
