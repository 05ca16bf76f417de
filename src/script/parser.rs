//! Recursive-descent parser for the pipeline script language.
//!
//! ```text
//! pipeline  := step ( "->" step )*
//! step      := input | output | transform | fork | group | fragment
//! transform := name "(" params? ")"
//! fork      := transform cluster
//! cluster   := ( "[" pipeline "]" | "{" pipeline (";" pipeline)* "}" )+
//! ```
//!
//! A *cluster* is a juxtaposed run of `[fragment]`s and `{group}`s.
//! Fragments are stitched onto every pipeline of the adjacent groups:
//! fragments seen so far prefix each newly created pipeline, later
//! fragments are appended to all existing ones. Groups whose pipelines
//! start with an input merge by key; groups without inputs merge
//! positionally.

use super::ast::{PipelineAst, Step, TransformStep};
use super::lexer::{Lexer, ParserError, Token, TokenType};

pub(crate) const EXPECTED_PIPELINE_STEP: &str = "Expected pipeline step";
const EXPECTED_PARAM_NAME: &str = "Expected 'parameter name (string)'";
const EXPECTED_PARAM_VALUE: &str = "Expected 'parameter value (string)'";
const EXPECTED_EQ: &str = "Expected '='";
const EXPECTED_SEP_OR_CLOSE: &str = "Expected ',' or ')'";
const FORKED_NEEDS_INPUT: &str = "Forked pipeline must start with a pipeline identifier (string)";
const FORKED_NEEDS_STEP: &str = "Forked pipeline must have at least one pipeline step";
const MULTIPLEXED_NO_INPUT: &str = "Multiplexed pipeline cannot start with an identifier (string)";
const MULTIPLE_OUTPUTS: &str = "Multiple sequential outputs are not allowed";

/// Parses a script into its top-level pipelines (separated by `;`).
pub fn parse_script(script: &str) -> Result<Vec<PipelineAst>, ParserError> {
    let tokens = Lexer::new(script).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_pipeline_list(Terminator::Eof)
}

/// What ends the pipeline list currently being parsed.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Terminator {
    Eof,
    Close,
}

impl Terminator {
    fn matches(self, typ: TokenType) -> bool {
        match self {
            Terminator::Eof => typ == TokenType::Eof,
            Terminator::Close => typ == TokenType::Close,
        }
    }

    fn message(self) -> &'static str {
        match self {
            Terminator::Eof => "Expected 'EOF'",
            Terminator::Close => "Expected '}'",
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// One pipeline of a cluster under construction.
struct ClusterPipe {
    /// The input key for keyed (forked / multi-input) pipelines.
    head: Option<Vec<Token>>,
    steps: Vec<Step>,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn parse_pipeline_list(&mut self, term: Terminator) -> Result<Vec<PipelineAst>, ParserError> {
        let mut pipelines = vec![self.parse_pipeline()?];
        loop {
            let token = self.peek().clone();
            if token.typ == TokenType::Sep {
                self.advance();
                pipelines.push(self.parse_pipeline()?);
            } else if term.matches(token.typ) {
                if term != Terminator::Eof {
                    self.advance();
                }
                return Ok(pipelines);
            } else {
                return Err(ParserError::new(token, term.message()));
            }
        }
    }

    fn parse_pipeline(&mut self) -> Result<PipelineAst, ParserError> {
        let mut steps = Vec::new();
        loop {
            let step = self.parse_step(steps.is_empty())?;
            steps.push(step);
            if self.peek().typ == TokenType::Next {
                self.advance();
            } else {
                return Ok(PipelineAst { steps });
            }
        }
    }

    fn parse_step(&mut self, is_first: bool) -> Result<Step, ParserError> {
        let token = self.peek().clone();
        match token.typ {
            TokenType::Str | TokenType::QuotStr => self.parse_word_step(is_first),
            TokenType::Open | TokenType::BracketOpen => self.parse_cluster(None, is_first),
            _ => Err(ParserError::new(token, EXPECTED_PIPELINE_STEP)),
        }
    }

    /// A step opening with a bareword: an input list, an output, a
    /// transform, or a fork when a cluster follows the transform.
    fn parse_word_step(&mut self, is_first: bool) -> Result<Step, ParserError> {
        let mut idents = vec![self.advance()];

        if self.peek().typ == TokenType::ParamOpen {
            let params = self.parse_params()?;
            let transform = TransformStep {
                name: idents.remove(0),
                params,
            };
            if matches!(self.peek().typ, TokenType::Open | TokenType::BracketOpen) {
                return self.parse_cluster(Some(transform), is_first);
            }
            return Ok(Step::Transform(transform));
        }

        while matches!(self.peek().typ, TokenType::Str | TokenType::QuotStr) {
            idents.push(self.advance());
        }
        if is_first {
            Ok(Step::Input(idents))
        } else if idents.len() > 1 {
            Err(ParserError::new(idents.swap_remove(0), MULTIPLE_OUTPUTS))
        } else {
            Ok(Step::Output(idents.swap_remove(0)))
        }
    }

    fn parse_params(&mut self) -> Result<Vec<(Token, Token)>, ParserError> {
        self.advance(); // consume '('
        let mut params = Vec::new();
        if self.peek().typ == TokenType::ParamClose {
            self.advance();
            return Ok(params);
        }
        loop {
            let name = match self.peek().typ {
                TokenType::Str | TokenType::QuotStr => self.advance(),
                _ => return Err(ParserError::new(self.peek().clone(), EXPECTED_PARAM_NAME)),
            };
            if self.peek().typ != TokenType::ParamEq {
                return Err(ParserError::new(self.peek().clone(), EXPECTED_EQ));
            }
            self.advance();
            let value = match self.peek().typ {
                TokenType::Str | TokenType::QuotStr => self.advance(),
                _ => return Err(ParserError::new(self.peek().clone(), EXPECTED_PARAM_VALUE)),
            };
            params.push((name, value));
            match self.peek().typ {
                TokenType::ParamSep => {
                    self.advance();
                }
                TokenType::ParamClose => {
                    self.advance();
                    return Ok(params);
                }
                _ => {
                    return Err(ParserError::new(
                        self.peek().clone(),
                        EXPECTED_SEP_OR_CLOSE,
                    ))
                }
            }
        }
    }

    /// Parses a juxtaposed run of fragments and groups and stitches them
    /// into one set of pipelines. With a preceding transform the cluster
    /// is that transform's fork, otherwise a multiplex / multi-input
    /// group.
    fn parse_cluster(
        &mut self,
        preceding: Option<TransformStep>,
        is_first: bool,
    ) -> Result<Step, ParserError> {
        let fork = preceding.is_some();
        let mut pipes: Vec<ClusterPipe> = Vec::new();
        let mut fragments: Vec<Step> = Vec::new();

        loop {
            match self.peek().typ {
                TokenType::BracketOpen => {
                    self.advance();
                    let fragment = self.parse_pipeline()?;
                    if self.peek().typ != TokenType::BracketClose {
                        return Err(ParserError::new(self.peek().clone(), "Expected ']'"));
                    }
                    self.advance();
                    for pipe in &mut pipes {
                        for step in &fragment.steps {
                            pipe.steps.push(adapt_step(step.clone(), false)?);
                        }
                    }
                    fragments.extend(fragment.steps);
                }
                TokenType::Open => {
                    self.advance();
                    let group = self.parse_pipeline_list(Terminator::Close)?;
                    self.merge_group(group, fork, is_first, &mut pipes, &fragments)?;
                }
                _ => break,
            }
        }

        if pipes.is_empty() {
            // A cluster of fragments without any group degenerates to a
            // single pipeline.
            pipes.push(ClusterPipe {
                head: None,
                steps: fragments,
            });
        }

        let pipelines = pipes
            .into_iter()
            .map(|pipe| {
                let mut steps = Vec::with_capacity(pipe.steps.len() + 1);
                if let Some(head) = pipe.head {
                    steps.push(Step::Input(head));
                }
                steps.extend(pipe.steps);
                PipelineAst { steps }
            })
            .collect();

        Ok(match preceding {
            Some(step) => Step::Fork { step, pipelines },
            None => Step::Pipelines(pipelines),
        })
    }

    fn merge_group(
        &self,
        group: Vec<PipelineAst>,
        fork: bool,
        is_first: bool,
        pipes: &mut Vec<ClusterPipe>,
        fragments: &[Step],
    ) -> Result<(), ParserError> {
        for (position, pipeline) in group.into_iter().enumerate() {
            let error_at = pipeline.first_token().cloned().unwrap_or_else(|| Token {
                typ: TokenType::Eof,
                lit: String::new(),
                start: 0,
                end: 0,
            });
            let has_input = pipeline.starts_with_input();

            if fork {
                if !has_input {
                    return Err(ParserError::new(error_at, FORKED_NEEDS_INPUT));
                }
                if pipeline.steps.len() < 2 {
                    return Err(ParserError::new(error_at, FORKED_NEEDS_STEP));
                }
            } else if !is_first && has_input {
                return Err(ParserError::new(error_at, MULTIPLEXED_NO_INPUT));
            }

            let mut steps = pipeline.steps.into_iter();
            if fork {
                // Keyed: an existing key continues its pipeline, a new key
                // starts a sibling prefixed by the fragments seen so far.
                let head = match steps.next() {
                    Some(Step::Input(tokens)) => tokens,
                    _ => unreachable!("fork inputs validated above"),
                };
                let existing = pipes.iter().position(|pipe| {
                    pipe.head.as_ref().is_some_and(|h| {
                        h.iter().map(Token::content).eq(head.iter().map(Token::content))
                    })
                });
                match existing {
                    Some(index) => {
                        for step in steps {
                            pipes[index].steps.push(adapt_step(step, false)?);
                        }
                    }
                    None => {
                        let mut collected = Vec::new();
                        for fragment in fragments {
                            collected.push(adapt_step(fragment.clone(), false)?);
                        }
                        for step in steps {
                            collected.push(adapt_step(step, false)?);
                        }
                        pipes.push(ClusterPipe {
                            head: Some(head),
                            steps: collected,
                        });
                    }
                }
            } else if !is_first && position < pipes.len() {
                // Positional: pipeline N of this group continues pipeline
                // N of the cluster.
                for step in steps {
                    pipes[position].steps.push(adapt_step(step, false)?);
                }
            } else if has_input {
                // A multi-input branch keeps its own endpoints and gets
                // the fragments after them.
                let head = match steps.next() {
                    Some(Step::Input(tokens)) => tokens,
                    _ => unreachable!("has_input checked above"),
                };
                let mut collected = Vec::new();
                for fragment in fragments {
                    collected.push(adapt_step(fragment.clone(), false)?);
                }
                for step in steps {
                    collected.push(adapt_step(step, false)?);
                }
                pipes.push(ClusterPipe {
                    head: Some(head),
                    steps: collected,
                });
            } else {
                let mut collected = Vec::new();
                for fragment in fragments {
                    collected.push(adapt_step(fragment.clone(), is_first)?);
                }
                collected.extend(steps);
                pipes.push(ClusterPipe {
                    head: None,
                    steps: collected,
                });
            }
        }
        Ok(())
    }
}

/// Re-resolves a stitched step for its final position: an input fragment
/// appended mid-pipeline becomes an output.
fn adapt_step(step: Step, at_head: bool) -> Result<Step, ParserError> {
    match step {
        Step::Input(mut tokens) if !at_head => {
            if tokens.len() > 1 {
                Err(ParserError::new(tokens.swap_remove(0), MULTIPLE_OUTPUTS))
            } else {
                Ok(Step::Output(tokens.swap_remove(0)))
            }
        }
        other => Ok(other),
    }
}
