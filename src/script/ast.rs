//! The pipeline AST produced by the parser.

use std::fmt::Write as _;

use super::lexer::Token;

/// A named step with parameters: `avg(window=10)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformStep {
    /// Step name token.
    pub name: Token,
    /// Parameters in source order.
    pub params: Vec<(Token, Token)>,
}

/// One step of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// One or more endpoint specifiers read simultaneously. Only legal at
    /// the head of a pipeline.
    Input(Vec<Token>),
    /// A terminal endpoint specifier.
    Output(Token),
    /// A named processor.
    Transform(TransformStep),
    /// A forking processor hosting keyed sub-pipelines.
    Fork {
        /// The fork's own name and parameters.
        step: TransformStep,
        /// Its sub-pipelines, each starting with an input key.
        pipelines: Vec<PipelineAst>,
    },
    /// A multiplex (broadcast) or multi-input (merged sources) group.
    Pipelines(Vec<PipelineAst>),
}

/// An ordered sequence of steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineAst {
    /// The steps, head first.
    pub steps: Vec<Step>,
}

impl PipelineAst {
    /// The first token of this pipeline, for error positions.
    pub fn first_token(&self) -> Option<&Token> {
        self.steps.first().and_then(Step::first_token)
    }

    /// Whether this pipeline begins with an input step.
    pub fn starts_with_input(&self) -> bool {
        matches!(self.steps.first(), Some(Step::Input(_)))
    }
}

impl Step {
    /// The first token of this step, for error positions.
    pub fn first_token(&self) -> Option<&Token> {
        match self {
            Step::Input(tokens) => tokens.first(),
            Step::Output(token) => Some(token),
            Step::Transform(step) => Some(&step.name),
            Step::Fork { step, .. } => Some(&step.name),
            Step::Pipelines(pipes) => pipes.first().and_then(PipelineAst::first_token),
        }
    }
}

/// Renders a script in canonical form: single spaces, `->` between steps,
/// `; ` between sibling pipelines. Re-parsing the output yields the same
/// structure.
pub fn format_script(pipelines: &[PipelineAst]) -> String {
    let mut out = String::new();
    for (i, pipeline) in pipelines.iter().enumerate() {
        if i > 0 {
            out.push_str(";\n");
        }
        format_pipeline(pipeline, &mut out);
    }
    out
}

fn format_pipeline(pipeline: &PipelineAst, out: &mut String) {
    for (i, step) in pipeline.steps.iter().enumerate() {
        if i > 0 {
            out.push_str(" -> ");
        }
        format_step(step, out);
    }
}

fn format_step(step: &Step, out: &mut String) {
    match step {
        Step::Input(tokens) => {
            for (i, token) in tokens.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                out.push_str(&token.lit);
            }
        }
        Step::Output(token) => out.push_str(&token.lit),
        Step::Transform(transform) => format_transform(transform, out),
        Step::Fork { step, pipelines } => {
            format_transform(step, out);
            format_group(pipelines, out);
        }
        Step::Pipelines(pipelines) => format_group(pipelines, out),
    }
}

fn format_transform(transform: &TransformStep, out: &mut String) {
    out.push_str(&transform.name.lit);
    out.push('(');
    for (i, (key, value)) in transform.params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}={}", key.lit, value.lit);
    }
    out.push(')');
}

fn format_group(pipelines: &[PipelineAst], out: &mut String) {
    out.push_str("{ ");
    for (i, pipeline) in pipelines.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        format_pipeline(pipeline, out);
    }
    out.push_str(" }");
}
