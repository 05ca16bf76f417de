//! The pipeline script language: lexer, parser, AST and builder.
//!
//! A script describes a directed acyclic flow of samples as a short text,
//! for example:
//!
//! ```text
//! data.csv -> fork_tags(tag=role){ web -> noop(); db -> drop() } -> out.csv
//! ```
//!
//! [`parse_script`] turns the text into an AST, [`ScriptBuilder`] lowers
//! and builds it into runnable [`SamplePipeline`](crate::SamplePipeline)s.

mod ast;
mod builder;
mod lexer;
mod parser;

pub use ast::{format_script, PipelineAst, Step, TransformStep};
pub use builder::ScriptBuilder;
pub use lexer::{Lexer, ParserError, Token, TokenType};
pub use parser::parse_script;
