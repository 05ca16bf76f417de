//! Lowering and building: from the parsed AST to runnable pipelines.
//!
//! The builder walks each parsed pipeline, resolves endpoints through the
//! [`EndpointFactory`] and step names through the [`Registry`], and emits
//! [`SamplePipeline`]s ready for a task group:
//!
//! - a pipeline without a head input gets the synthetic `empty://-` source
//! - a bare group mid-pipeline is lowered to a fork over the implicit
//!   multiplex distributor with keys `0..N-1`
//! - a head group with inputs (multi-input) builds one pipeline per
//!   branch, all funneled through a fan-in stage into the shared
//!   continuation
//!
//! Name and parameter errors are annotated with the offending token's
//! position.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::endpoint::EndpointFactory;
use crate::error::PipelineError;
use crate::fork::{Fork, MultiplexDistributor, PipelineTemplate};
use crate::pipeline::SamplePipeline;
use crate::processor::FanInProcessor;
use crate::registry::{Registry, StepParams};

use super::ast::{PipelineAst, Step, TransformStep};
use super::lexer::Token;
use super::parser::parse_script;

/// How a pipeline's head step provides its samples.
enum HeadKind {
    /// Explicit input endpoints.
    Input,
    /// A group of branches with their own inputs, merged.
    MultiInput,
    /// No input written; the synthetic empty source is prepended.
    Synthetic,
}

/// Builds runnable pipelines from scripts.
pub struct ScriptBuilder {
    registry: Arc<Registry>,
    endpoints: Arc<EndpointFactory>,
    template_ids: Arc<AtomicUsize>,
}

impl ScriptBuilder {
    /// Creates a builder over the given step registry and endpoint
    /// factory.
    pub fn new(registry: Arc<Registry>, endpoints: Arc<EndpointFactory>) -> Self {
        Self {
            registry,
            endpoints,
            template_ids: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Parses, validates and builds a whole script.
    pub fn build_script(&self, script: &str) -> Result<Vec<SamplePipeline>, PipelineError> {
        let parsed = parse_script(script)?;
        if parsed.is_empty() {
            return Err(PipelineError::Config("Empty pipeline is not allowed".into()));
        }
        let mut pipelines = Vec::new();
        for ast in parsed {
            pipelines.extend(self.build_pipeline(ast)?);
        }
        Ok(pipelines)
    }

    /// Builds one top-level pipeline. Multi-input heads produce one extra
    /// pipeline per branch, all feeding the shared continuation.
    fn build_pipeline(&self, ast: PipelineAst) -> Result<Vec<SamplePipeline>, PipelineError> {
        let mut main = SamplePipeline::new();
        let mut extras = Vec::new();
        let mut steps = ast.steps.into_iter().peekable();

        let head = match steps.peek() {
            Some(Step::Input(_)) => HeadKind::Input,
            Some(Step::Pipelines(branches))
                if branches.iter().all(PipelineAst::starts_with_input) =>
            {
                HeadKind::MultiInput
            }
            _ => HeadKind::Synthetic,
        };
        match head {
            HeadKind::Input => {
                let Some(Step::Input(tokens)) = steps.next() else {
                    unreachable!("peeked above")
                };
                let specs: Vec<String> =
                    tokens.iter().map(|t| t.content().to_string()).collect();
                let source = self
                    .endpoints
                    .create_source(&specs)
                    .map_err(|err| annotate(err, &tokens[0]))?;
                main.add_source(source);
            }
            HeadKind::MultiInput => {
                let Some(Step::Pipelines(branches)) = steps.next() else {
                    unreachable!("peeked above")
                };
                // A branch may itself expand into several pipelines; only
                // its continuation (the last one) feeds the fan-in.
                let mut built: Vec<SamplePipeline> = Vec::new();
                let mut continuations = Vec::new();
                for branch in branches {
                    let branch_pipes = self.build_pipeline(branch)?;
                    if branch_pipes.is_empty() {
                        continue;
                    }
                    continuations.push(built.len() + branch_pipes.len() - 1);
                    built.extend(branch_pipes);
                }
                let fan_in = Arc::new(FanInProcessor::new(continuations.len()));
                for index in continuations {
                    built[index].add(fan_in.clone());
                }
                extras.extend(built);
                main.add(fan_in);
            }
            HeadKind::Synthetic => {
                let source = self.endpoints.create_source(&["empty://-".to_string()])?;
                main.add_source(source);
            }
        }

        for step in steps {
            self.build_step(step, &mut main)?;
        }
        if main.processors().is_empty() && main.sources().is_empty() {
            return Ok(extras);
        }
        extras.push(main);
        Ok(extras)
    }

    /// Builds one body step into the pipeline.
    fn build_step(&self, step: Step, into: &mut SamplePipeline) -> Result<(), PipelineError> {
        match step {
            Step::Output(token) => {
                let sink = self
                    .endpoints
                    .create_sink(token.content())
                    .map_err(|err| annotate(err, &token))?;
                into.add(sink);
            }
            Step::Transform(transform) => {
                let (registered, params) = self.resolve(&transform)?;
                if registered.is_fork() {
                    return Err(annotate(
                        PipelineError::InvalidStepParams {
                            step: transform.name.content().to_string(),
                            reason: "fork step needs sub-pipelines in { }".into(),
                        },
                        &transform.name,
                    ));
                }
                let processor = registered
                    .build_transform(&params, self.endpoints.config())
                    .map_err(|err| annotate(err, &transform.name))?;
                into.add(processor);
            }
            Step::Fork { step, pipelines } => {
                let (registered, params) = self.resolve(&step)?;
                let mut subpipelines = Vec::new();
                for sub in pipelines {
                    let mut steps = sub.steps.into_iter();
                    let keys = match steps.next() {
                        Some(Step::Input(tokens)) => tokens,
                        _ => {
                            return Err(annotate(
                                PipelineError::Config(
                                    "forked pipeline lost its input keys".into(),
                                ),
                                &step.name,
                            ))
                        }
                    };
                    let template = self.make_template(steps.collect())?;
                    for key in keys {
                        subpipelines.push((key.content().to_string(), template.clone()));
                    }
                }
                let fork = registered
                    .build_fork(&params, subpipelines, self.endpoints.config())
                    .map_err(|err| annotate(err, &step.name))?;
                into.add(fork);
            }
            Step::Pipelines(branches) => {
                // A bare group mid-pipeline broadcasts: lower it to a fork
                // over the implicit multiplex distributor.
                let mut targets = Vec::new();
                for (index, branch) in branches.into_iter().enumerate() {
                    let template = self.make_template(branch.steps)?;
                    targets.push((index.to_string(), template));
                }
                let fork = Fork::new(
                    Box::new(MultiplexDistributor::new(targets)),
                    self.endpoints.config(),
                );
                into.add(Arc::new(fork));
            }
            Step::Input(tokens) => {
                return Err(annotate(
                    PipelineError::Config("input endpoints are only allowed at the start".into()),
                    &tokens[0],
                ));
            }
        }
        Ok(())
    }

    /// Creates a sub-pipeline template from body steps. The body is built
    /// once eagerly so script errors surface at build time, then rebuilt
    /// per fork instantiation.
    fn make_template(&self, steps: Vec<Step>) -> Result<Arc<PipelineTemplate>, PipelineError> {
        self.body_to_pipeline(steps.clone())?;

        let id = self.template_ids.fetch_add(1, Ordering::Relaxed);
        let builder = self.subbuilder();
        Ok(PipelineTemplate::new(
            id,
            Box::new(move || builder.body_to_pipeline(steps.clone())),
        ))
    }

    /// A clone of this builder sharing the template id counter, for use
    /// inside template factories.
    fn subbuilder(&self) -> ScriptBuilder {
        ScriptBuilder {
            registry: self.registry.clone(),
            endpoints: self.endpoints.clone(),
            template_ids: self.template_ids.clone(),
        }
    }

    fn body_to_pipeline(&self, steps: Vec<Step>) -> Result<SamplePipeline, PipelineError> {
        let mut pipeline = SamplePipeline::new();
        for step in steps {
            self.build_step(step, &mut pipeline)?;
        }
        Ok(pipeline)
    }

    /// Looks up a transform step in the registry and validates its
    /// parameters, annotating failures with the step's position.
    fn resolve<'reg>(
        &'reg self,
        transform: &TransformStep,
    ) -> Result<(&'reg crate::registry::RegisteredStep, StepParams), PipelineError> {
        let name = transform.name.content();
        let registered = self.registry.get(name).ok_or_else(|| {
            annotate(
                PipelineError::UnknownStep {
                    name: name.to_string(),
                },
                &transform.name,
            )
        })?;

        let mut params = StepParams::new();
        for (key, value) in &transform.params {
            params.insert(key.content().to_string(), value.content().to_string());
        }
        registered
            .validate_params(&params)
            .map_err(|err| annotate(err, &transform.name))?;
        Ok((registered, params))
    }
}

/// Attaches a token position to a build error.
fn annotate(err: PipelineError, token: &Token) -> PipelineError {
    match err {
        already @ PipelineError::Script(_) => already,
        other => PipelineError::Config(format!("{other} (at {})", token.position())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    fn builder() -> ScriptBuilder {
        ScriptBuilder::new(
            Arc::new(Registry::with_builtins()),
            Arc::new(EndpointFactory::new(PipelineConfig::default())),
        )
    }

    #[test]
    fn test_build_linear_pipeline() {
        let pipelines = builder().build_script("empty://- -> noop() -> drop()").unwrap();
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].sources().len(), 1);
        assert_eq!(pipelines[0].processors().len(), 2);
    }

    #[test]
    fn test_headless_script_gets_empty_source() {
        let pipelines = builder().build_script("noop()").unwrap();
        assert_eq!(pipelines[0].sources().len(), 1);
        assert_eq!(pipelines[0].sources()[0].name(), "empty://-");
    }

    #[test]
    fn test_multiplex_lowering() {
        let pipelines = builder()
            .build_script("empty://- -> { noop(); noop() } -> drop()")
            .unwrap();
        assert_eq!(pipelines.len(), 1);
        let names: Vec<String> = pipelines[0]
            .processors()
            .iter()
            .map(|p| p.name())
            .collect();
        assert!(names[0].starts_with("multiplex(2)"));
        assert_eq!(names[1], "drop");
    }

    #[test]
    fn test_fork_step_with_keys() {
        let pipelines = builder()
            .build_script("empty://- -> fork_tags(tag=role){ web -> noop(); db -> drop() }")
            .unwrap();
        assert_eq!(pipelines[0].processors().len(), 1);
        assert!(pipelines[0].processors()[0].is_fork());
    }

    #[test]
    fn test_multi_input_head_builds_branches() {
        let pipelines = builder()
            .build_script("{ empty://- -> noop(); empty://- -> noop() } -> drop()")
            .unwrap();
        // Two branch pipelines plus the continuation.
        assert_eq!(pipelines.len(), 3);
        let continuation = &pipelines[2];
        assert!(continuation.sources().is_empty());
        assert_eq!(continuation.processors()[0].name(), "fan_in");
    }

    #[test]
    fn test_unknown_step_is_annotated() {
        let err = match builder().build_script("empty://- -> nosuch()") {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        let msg = err.to_string();
        assert!(msg.contains("unknown pipeline step 'nosuch'"));
        assert!(msg.contains("[13-19"), "position missing: {msg}");
    }

    #[test]
    fn test_invalid_param_is_annotated() {
        let err = match builder().build_script("noop(bogus=1)") {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        let msg = err.to_string();
        assert!(msg.contains("unknown parameter 'bogus'"));
        assert!(msg.contains("(at ["), "position missing: {msg}");
    }

    #[test]
    fn test_fork_step_without_group_rejected() {
        let err = match builder().build_script("empty://- -> fork_tags(tag=role)") {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("sub-pipelines"));
    }

    #[test]
    fn test_parse_errors_pass_through() {
        let err = match builder().build_script("a(((") {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, PipelineError::Script(_)));
        assert!(err.to_string().contains("Expected 'parameter name (string)'"));
    }

    #[test]
    fn test_shared_template_for_multi_key_subpipeline() {
        // Both keys of one sub-pipeline must map to one template, so the
        // fork shares a single running instance between them.
        let pipelines = builder()
            .build_script("empty://- -> fork_tags(tag=role){ web db -> noop() }")
            .unwrap();
        assert_eq!(pipelines.len(), 1);
    }
}
